//! The legacy plugin key/value layout, kept in the same database so that
//! imported blobs can be migrated in place.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use runbook_core::KvStore;

use crate::{collect_rows, SqliteStore};

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT pvalue FROM plugin_kv WHERE pkey = ?1",
            params![key],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .with_context(|| format!("failed to read kv key '{key}'"))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO plugin_kv(pkey, pvalue) VALUES (?1, ?2)
             ON CONFLICT(pkey) DO UPDATE SET pvalue = excluded.pvalue",
            params![key, value],
        )
        .with_context(|| format!("failed to write kv key '{key}'"))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM plugin_kv WHERE pkey = ?1", params![key])
            .with_context(|| format!("failed to delete kv key '{key}'"))?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT pkey FROM plugin_kv ORDER BY pkey ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect_rows(rows).context("failed to list kv keys")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture_store, must};

    #[test]
    fn set_overwrites_and_delete_removes() {
        let store = fixture_store();
        must(store.set("run_index", br#"{"run_ids":[]}"#));
        must(store.set("run_index", br#"{"run_ids":["a"]}"#));
        must(store.set("playbook_index", b"{}"));

        assert_eq!(
            must(store.get("run_index")),
            Some(br#"{"run_ids":["a"]}"#.to_vec())
        );
        assert_eq!(
            must(store.keys()),
            vec!["playbook_index".to_string(), "run_index".to_string()]
        );

        must(store.delete("run_index"));
        assert_eq!(must(store.get("run_index")), None);
    }
}
