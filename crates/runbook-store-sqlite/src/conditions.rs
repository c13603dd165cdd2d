use std::collections::BTreeSet;

use anyhow::{Context, Result};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use runbook_core::{
    new_id, now_millis, Condition, ConditionExpr, ConditionFilterOptions, ConditionStore,
};

use crate::{collect_rows, conversion_error, invalid_argument, not_found, write_error, SqliteStore};

const CONDITION_COLUMNS: &str =
    "id, playbook_id, run_id, version, expr_json, create_at, update_at, delete_at";

fn map_condition_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Condition> {
    let raw_expr: String = row.get(4)?;
    let expr = ConditionExpr::from_json(&raw_expr)
        .map_err(|err| conversion_error(4, Type::Text, err.to_string()))?;
    Ok(Condition {
        id: row.get(0)?,
        playbook_id: row.get(1)?,
        run_id: row.get(2)?,
        version: row.get(3)?,
        expr,
        create_at: row.get(5)?,
        update_at: row.get(6)?,
        delete_at: row.get(7)?,
    })
}

/// Expression JSON plus the extracted field and option ID sets, ready to bind.
struct EncodedCondition {
    expr_json: String,
    field_ids_json: String,
    option_ids_json: String,
}

fn encode(expr: &ConditionExpr) -> Result<EncodedCondition> {
    let json_set = |ids: BTreeSet<String>| serde_json::to_string(&ids);
    Ok(EncodedCondition {
        expr_json: serde_json::to_string(expr).context("failed to encode condition expression")?,
        field_ids_json: json_set(expr.field_ids()).context("failed to encode property field ids")?,
        option_ids_json: json_set(expr.option_ids())
            .context("failed to encode property option ids")?,
    })
}

/// Validates structure and trims comparison values.
fn prepare(condition: &Condition) -> Result<Condition> {
    let mut prepared = condition.clone();
    prepared.expr.sanitize();
    prepared
        .expr
        .validate(&[])
        .map_err(anyhow::Error::new)
        .context("invalid condition expression")?;
    Ok(prepared)
}

fn fetch(conn: &Connection, playbook_id: &str, id: &str) -> Result<Option<Condition>> {
    conn.query_row(
        &format!(
            "SELECT {CONDITION_COLUMNS} FROM conditions
             WHERE id = ?1 AND playbook_id = ?2 AND delete_at = 0"
        ),
        params![id, playbook_id],
        map_condition_row,
    )
    .optional()
    .with_context(|| format!("failed to get condition '{id}' of playbook '{playbook_id}'"))
}

impl ConditionStore for SqliteStore {
    fn create_condition(&self, playbook_id: &str, condition: &Condition) -> Result<Condition> {
        if playbook_id.is_empty() {
            return Err(invalid_argument("condition must belong to a playbook".to_string()));
        }
        let mut stored = prepare(condition)?;
        if stored.id.is_empty() {
            stored.id = new_id();
        }
        stored.playbook_id = playbook_id.to_string();
        if stored.version == 0 {
            stored.version = 1;
        }
        let now = now_millis();
        if stored.create_at == 0 {
            stored.create_at = now;
        }
        if stored.update_at == 0 {
            stored.update_at = now;
        }
        let encoded = encode(&stored.expr)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO conditions(
                id, playbook_id, run_id, version, expr_json, property_field_ids,
                property_option_ids, create_at, update_at, delete_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                stored.id,
                stored.playbook_id,
                stored.run_id,
                stored.version,
                encoded.expr_json,
                encoded.field_ids_json,
                encoded.option_ids_json,
                stored.create_at,
                stored.update_at,
                stored.delete_at,
            ],
        )
        .map_err(|err| write_error(err, || format!("condition '{}'", stored.id)))
        .with_context(|| format!("failed to store condition for playbook '{playbook_id}'"))?;
        Ok(stored)
    }

    fn get_condition(&self, playbook_id: &str, id: &str) -> Result<Condition> {
        let conn = self.conn()?;
        fetch(&conn, playbook_id, id)?
            .ok_or_else(|| not_found(format!("condition '{id}' of playbook '{playbook_id}'")))
    }

    fn update_condition(&self, playbook_id: &str, condition: &Condition) -> Result<Condition> {
        let mut stored = prepare(condition)?;
        stored.playbook_id = playbook_id.to_string();
        stored.update_at = now_millis();
        let encoded = encode(&stored.expr)?;

        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE conditions
                 SET expr_json = ?1, run_id = ?2, property_field_ids = ?3,
                     property_option_ids = ?4, update_at = ?5
                 WHERE id = ?6 AND playbook_id = ?7 AND delete_at = 0",
                params![
                    encoded.expr_json,
                    stored.run_id,
                    encoded.field_ids_json,
                    encoded.option_ids_json,
                    stored.update_at,
                    stored.id,
                    playbook_id,
                ],
            )
            .with_context(|| format!("failed to update condition '{}'", stored.id))?;
        if updated == 0 {
            return Err(not_found(format!(
                "condition '{}' of playbook '{playbook_id}'",
                stored.id
            )));
        }
        fetch(&conn, playbook_id, &stored.id)?.ok_or_else(|| {
            not_found(format!("condition '{}' of playbook '{playbook_id}'", stored.id))
        })
    }

    fn delete_condition(&self, playbook_id: &str, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE conditions SET delete_at = ?1
                 WHERE id = ?2 AND playbook_id = ?3 AND delete_at = 0",
                params![now_millis(), id, playbook_id],
            )
            .with_context(|| format!("failed to delete condition '{id}'"))?;
        if updated == 0 {
            return Err(not_found(format!("condition '{id}' of playbook '{playbook_id}'")));
        }
        Ok(())
    }

    fn get_conditions(
        &self,
        playbook_id: &str,
        options: &ConditionFilterOptions,
    ) -> Result<Vec<Condition>> {
        let mut sql = format!(
            "SELECT {CONDITION_COLUMNS} FROM conditions WHERE delete_at = 0 AND playbook_id = ?"
        );
        let mut values = vec![Value::Text(playbook_id.to_string())];
        if !options.run_id.is_empty() {
            sql.push_str(" AND run_id = ?");
            values.push(Value::Text(options.run_id.clone()));
        }
        sql.push_str(" ORDER BY create_at DESC, id DESC");
        if options.per_page > 0 {
            sql.push_str(&format!(
                " LIMIT {} OFFSET {}",
                options.per_page,
                options.page.max(0).saturating_mul(options.per_page)
            ));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), map_condition_row)?;
        collect_rows(rows)
            .with_context(|| format!("failed to get conditions for playbook '{playbook_id}'"))
    }

    fn count_conditions_for_run(&self, playbook_id: &str, run_id: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM conditions
             WHERE playbook_id = ?1 AND run_id = ?2 AND delete_at = 0",
            params![playbook_id, run_id],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to count conditions for run '{run_id}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture_store, must};
    use runbook_core::{classify, ErrorClass};
    use serde_json::json;

    fn condition(run_id: &str, create_at: i64, raw: serde_json::Value) -> Condition {
        let expr = match serde_json::from_value(raw) {
            Ok(expr) => expr,
            Err(err) => panic!("bad fixture expression: {err}"),
        };
        Condition {
            id: String::new(),
            playbook_id: String::new(),
            run_id: run_id.to_string(),
            version: 0,
            expr,
            create_at,
            update_at: 0,
            delete_at: 0,
        }
    }

    fn severity_is(option: &str) -> serde_json::Value {
        json!({"is": {"field_id": "severity", "value": [option]}})
    }

    #[test]
    fn create_sets_version_and_indexes_ids() {
        let store = fixture_store();
        let created = must(store.create_condition(
            "pb1",
            &condition(
                "",
                0,
                json!({"and": [
                    {"is": {"field_id": "severity", "value": ["sev1", "sev2"]}},
                    {"isNot": {"field_id": "summary", "value": "  noise "}}
                ]}),
            ),
        ));
        assert_eq!(created.version, 1);
        assert_eq!(created.playbook_id, "pb1");
        assert!(created.create_at > 0);

        let conn = must(store.conn());
        let (fields, options): (String, String) = match conn.query_row(
            "SELECT property_field_ids, property_option_ids FROM conditions WHERE id = ?1",
            params![created.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ) {
            Ok(value) => value,
            Err(err) => panic!("query failed: {err}"),
        };
        assert_eq!(fields, r#"["severity","summary"]"#);
        assert_eq!(options, r#"["sev1","sev2"]"#);
        drop(conn);

        let fetched = must(store.get_condition("pb1", &created.id));
        assert_eq!(fetched, created);
        assert!(matches!(
            &fetched.expr,
            ConditionExpr::And(children)
                if matches!(&children[1], ConditionExpr::IsNot(cmp) if cmp.value == json!("noise"))
        ));
    }

    #[test]
    fn create_rejects_too_deep_nesting() {
        let store = fixture_store();
        let nested = json!({"and": [{"or": [{"and": [severity_is("sev1")]}]}]});
        let err = match store.create_condition("pb1", &condition("", 0, nested)) {
            Ok(_) => panic!("expected validation failure"),
            Err(err) => err,
        };
        assert_eq!(classify(&err), ErrorClass::BadRequest);
    }

    #[test]
    fn list_filters_by_run_and_orders_newest_first() {
        let store = fixture_store();
        let first = must(store.create_condition("pb1", &condition("", 100, severity_is("a"))));
        let second = must(store.create_condition("pb1", &condition("run1", 200, severity_is("b"))));
        let third = must(store.create_condition("pb1", &condition("run1", 300, severity_is("c"))));
        must(store.create_condition("pb2", &condition("run1", 400, severity_is("d"))));

        let all = must(store.get_conditions("pb1", &ConditionFilterOptions::default()));
        let ids: Vec<&str> = all.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![third.id.as_str(), second.id.as_str(), first.id.as_str()]);

        let page = must(store.get_conditions(
            "pb1",
            &ConditionFilterOptions {
                run_id: "run1".to_string(),
                page: 1,
                per_page: 1,
            },
        ));
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, second.id);
        assert_eq!(must(store.count_conditions_for_run("pb1", "run1")), 2);
    }

    #[test]
    fn update_and_delete_respect_playbook_scope() {
        let store = fixture_store();
        let mut created =
            must(store.create_condition("pb1", &condition("", 100, severity_is("a"))));
        created.expr = match serde_json::from_value(severity_is("z")) {
            Ok(expr) => expr,
            Err(err) => panic!("bad expression: {err}"),
        };
        let updated = must(store.update_condition("pb1", &created));
        assert_eq!(updated.expr.option_ids().into_iter().collect::<Vec<_>>(), vec!["z"]);
        assert!(updated.update_at >= created.update_at);

        assert!(store.update_condition("pb2", &created).is_err());
        let err = match store.delete_condition("pb2", &created.id) {
            Ok(()) => panic!("foreign playbook must not delete"),
            Err(err) => err,
        };
        assert_eq!(classify(&err), ErrorClass::NotFound);

        must(store.delete_condition("pb1", &created.id));
        assert!(store.get_condition("pb1", &created.id).is_err());
        assert_eq!(must(store.count_conditions_for_run("pb1", "")), 0);
    }
}
