use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use runbook_core::checklist::populate_ids;
use runbook_core::{
    new_id, now_millis, position, ListResults, Playbook, PlaybookFilterOptions, PlaybookStore,
    RequesterInfo,
};

use crate::query::{compile_playbook_query, PLAYBOOK_COLUMNS};
use crate::{
    bool_to_sql, collect_rows, conversion_error, invalid_argument, not_found, placeholders,
    text_values, write_error, SqliteStore,
};

fn map_playbook_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Playbook> {
    let checklists_raw: String = row.get(9)?;
    let checklists = position::from_blob(&checklists_raw)
        .map_err(|err| conversion_error(9, Type::Text, err.to_string()))?;
    Ok(Playbook {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        team_id: row.get(3)?,
        create_public_run: row.get::<_, i64>(4)? != 0,
        create_at: row.get(5)?,
        delete_at: row.get(6)?,
        num_stages: row.get(7)?,
        num_steps: row.get(8)?,
        checklists,
        member_ids: Vec::new(),
        broadcast_channel_id: row.get(10)?,
        broadcast_enabled: row.get::<_, i64>(11)? != 0,
        webhook_on_creation_url: row.get(12)?,
        webhook_on_status_update_url: row.get(13)?,
    })
}

/// Assigns missing checklist IDs and recomputes the derived counts.
fn prepare(playbook: &Playbook) -> Playbook {
    let mut prepared = playbook.clone();
    populate_ids(&mut prepared.checklists);
    prepared.refresh_counts();
    prepared
}

/// Inserts the playbook row and its members. The caller owns the transaction.
pub(crate) fn insert_playbook(conn: &Connection, playbook: &Playbook) -> Result<()> {
    let checklists_json = position::to_blob(&playbook.checklists)
        .with_context(|| format!("failed to encode checklists of playbook '{}'", playbook.id))?;
    conn.execute(
        "INSERT INTO playbooks(
            id, title, description, team_id, create_public_run, create_at, delete_at,
            num_stages, num_steps, checklists_json, broadcast_channel_id, broadcast_enabled,
            webhook_on_creation_url, webhook_on_status_update_url
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            playbook.id,
            playbook.title,
            playbook.description,
            playbook.team_id,
            bool_to_sql(playbook.create_public_run),
            playbook.create_at,
            playbook.delete_at,
            playbook.num_stages,
            playbook.num_steps,
            checklists_json,
            playbook.broadcast_channel_id,
            bool_to_sql(playbook.broadcast_enabled),
            playbook.webhook_on_creation_url,
            playbook.webhook_on_status_update_url,
        ],
    )
    .map_err(|err| write_error(err, || format!("playbook '{}'", playbook.id)))
    .with_context(|| format!("failed to insert playbook '{}'", playbook.id))?;
    write_members(conn, &playbook.id, &playbook.member_ids)
}

fn write_members(conn: &Connection, playbook_id: &str, member_ids: &[String]) -> Result<()> {
    conn.execute(
        "DELETE FROM playbook_members WHERE playbook_id = ?1",
        params![playbook_id],
    )
    .with_context(|| format!("failed to clear members of playbook '{playbook_id}'"))?;
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO playbook_members(playbook_id, member_id) VALUES (?1, ?2)",
    )?;
    for member_id in member_ids {
        stmt.execute(params![playbook_id, member_id.to_lowercase()])
            .with_context(|| format!("failed to add member to playbook '{playbook_id}'"))?;
    }
    Ok(())
}

fn attach_members(conn: &Connection, playbooks: &mut [Playbook]) -> Result<()> {
    if playbooks.is_empty() {
        return Ok(());
    }
    let ids: Vec<String> = playbooks.iter().map(|playbook| playbook.id.clone()).collect();
    let mut stmt = conn.prepare(&format!(
        "SELECT playbook_id, member_id FROM playbook_members
         WHERE playbook_id IN ({})
         ORDER BY playbook_id ASC, member_id ASC",
        placeholders(ids.len())
    ))?;
    let rows = stmt.query_map(params_from_iter(text_values(&ids)), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut members: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (playbook_id, member_id) in collect_rows(rows).context("failed to load playbook members")? {
        members.entry(playbook_id).or_default().push(member_id);
    }
    for playbook in playbooks {
        playbook.member_ids = members.remove(&playbook.id).unwrap_or_default();
    }
    Ok(())
}

impl PlaybookStore for SqliteStore {
    fn create_playbook(&self, playbook: &Playbook) -> Result<Playbook> {
        if !playbook.id.is_empty() {
            return Err(invalid_argument(format!(
                "new playbook must not carry an id, got '{}'",
                playbook.id
            )));
        }
        if playbook.team_id.is_empty() {
            return Err(invalid_argument("playbook must belong to a team".to_string()));
        }
        let mut stored = prepare(playbook);
        stored.id = new_id();
        if stored.create_at == 0 {
            stored.create_at = now_millis();
        }

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("failed to start playbook transaction")?;
        insert_playbook(&tx, &stored)?;
        tx.commit().context("failed to commit playbook transaction")?;
        Ok(stored)
    }

    fn get_playbook(&self, id: &str) -> Result<Playbook> {
        if id.is_empty() {
            return Err(not_found("playbook with empty id".to_string()));
        }
        let conn = self.conn()?;
        let playbook = conn
            .query_row(
                &format!("SELECT {PLAYBOOK_COLUMNS} FROM playbooks p WHERE p.id = ?1"),
                params![id],
                map_playbook_row,
            )
            .optional()
            .with_context(|| format!("failed to get playbook by id '{id}'"))?
            .ok_or_else(|| not_found(format!("playbook '{id}'")))?;
        let mut playbooks = vec![playbook];
        attach_members(&conn, &mut playbooks)?;
        playbooks
            .pop()
            .ok_or_else(|| not_found(format!("playbook '{id}'")))
    }

    fn get_playbooks(&self) -> Result<Vec<Playbook>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PLAYBOOK_COLUMNS} FROM playbooks p WHERE p.delete_at = 0 ORDER BY p.id ASC"
        ))?;
        let rows = stmt.query_map([], map_playbook_row)?;
        let mut playbooks = collect_rows(rows).context("failed to list playbooks")?;
        attach_members(&conn, &mut playbooks)?;
        Ok(playbooks)
    }

    fn get_playbooks_for_team(
        &self,
        requester: &RequesterInfo,
        team_id: &str,
        options: &PlaybookFilterOptions,
    ) -> Result<ListResults<Playbook>> {
        let query = compile_playbook_query(requester, team_id, options)
            .context("failed to compile playbook query")?;
        tracing::debug!(sql = %query.results_sql(), "listing playbooks");

        let conn = self.conn()?;
        let total_count: i64 = conn
            .query_row(&query.count_sql(), params_from_iter(query.params.iter()), |row| {
                row.get(0)
            })
            .with_context(|| format!("failed to count playbooks for team '{team_id}'"))?;
        let mut stmt = conn.prepare(&query.results_sql())?;
        let rows = stmt.query_map(params_from_iter(query.params.iter()), map_playbook_row)?;
        let mut playbooks = collect_rows(rows)
            .with_context(|| format!("failed to list playbooks for team '{team_id}'"))?;
        attach_members(&conn, &mut playbooks)?;
        Ok(query.paging.results(playbooks, total_count))
    }

    fn update_playbook(&self, playbook: &Playbook) -> Result<()> {
        if playbook.id.is_empty() {
            return Err(invalid_argument("playbook id must not be empty".to_string()));
        }
        let stored = prepare(playbook);
        let checklists_json = position::to_blob(&stored.checklists)
            .with_context(|| format!("failed to encode checklists of playbook '{}'", stored.id))?;

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("failed to start playbook transaction")?;
        let updated = tx
            .execute(
                "UPDATE playbooks
                 SET title = ?1, description = ?2, team_id = ?3, create_public_run = ?4,
                     delete_at = ?5, num_stages = ?6, num_steps = ?7, checklists_json = ?8,
                     broadcast_channel_id = ?9, broadcast_enabled = ?10,
                     webhook_on_creation_url = ?11, webhook_on_status_update_url = ?12
                 WHERE id = ?13",
                params![
                    stored.title,
                    stored.description,
                    stored.team_id,
                    bool_to_sql(stored.create_public_run),
                    stored.delete_at,
                    stored.num_stages,
                    stored.num_steps,
                    checklists_json,
                    stored.broadcast_channel_id,
                    bool_to_sql(stored.broadcast_enabled),
                    stored.webhook_on_creation_url,
                    stored.webhook_on_status_update_url,
                    stored.id,
                ],
            )
            .with_context(|| format!("failed to update playbook '{}'", stored.id))?;
        if updated == 0 {
            return Err(not_found(format!("playbook '{}'", stored.id)));
        }
        write_members(&tx, &stored.id, &stored.member_ids)?;
        tx.commit().context("failed to commit playbook transaction")?;
        Ok(())
    }

    fn archive_playbook(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE playbooks SET delete_at = ?1 WHERE id = ?2 AND delete_at = 0",
                params![now_millis(), id],
            )
            .with_context(|| format!("failed to archive playbook '{id}'"))?;
        if updated == 0 {
            return Err(not_found(format!("active playbook '{id}'")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture_store, must};
    use runbook_core::{classify, Checklist, ChecklistItem, ErrorClass};

    fn fixture_playbook(title: &str, team_id: &str, members: &[&str]) -> Playbook {
        Playbook {
            title: title.to_string(),
            team_id: team_id.to_string(),
            checklists: vec![
                Checklist::new(
                    "stage one",
                    vec![ChecklistItem::new("step a"), ChecklistItem::new("step b")],
                ),
                Checklist::new("stage two", vec![ChecklistItem::new("step c")]),
            ],
            member_ids: members.iter().map(|member| (*member).to_string()).collect(),
            ..Playbook::default()
        }
    }

    #[test]
    fn create_assigns_ids_and_counts() {
        let store = fixture_store();
        let created = must(store.create_playbook(&fixture_playbook("Outage", "t1", &["alice"])));
        assert!(!created.id.is_empty());
        assert_eq!((created.num_stages, created.num_steps), (2, 3));
        assert!(created
            .checklists
            .iter()
            .flat_map(|checklist| checklist.items.iter())
            .all(|item| !item.id.is_empty()));

        let fetched = must(store.get_playbook(&created.id));
        assert_eq!(fetched, created);
    }

    #[test]
    fn create_rejects_preset_id() {
        let store = fixture_store();
        let mut playbook = fixture_playbook("Outage", "t1", &[]);
        playbook.id = "preset".to_string();
        let err = match store.create_playbook(&playbook) {
            Ok(_) => panic!("expected invalid argument"),
            Err(err) => err,
        };
        assert_eq!(classify(&err), ErrorClass::BadRequest);
    }

    #[test]
    fn team_listing_applies_membership_rules() {
        let store = fixture_store();
        must(store.add_team_member("t1", "alice"));
        must(store.add_team_member("t1", "bob"));
        let open = must(store.create_playbook(&fixture_playbook("Open", "t1", &[])));
        let restricted =
            must(store.create_playbook(&fixture_playbook("Restricted", "t1", &["alice"])));
        must(store.create_playbook(&fixture_playbook("Elsewhere", "t2", &[])));

        let options = PlaybookFilterOptions {
            sort: "title".to_string(),
            per_page: 10,
            ..PlaybookFilterOptions::default()
        };
        let for_alice = must(store.get_playbooks_for_team(
            &RequesterInfo::new("alice"),
            "t1",
            &options,
        ));
        assert_eq!(for_alice.total_count, 2);
        let titles: Vec<&str> = for_alice.items.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["Open", "Restricted"]);

        let for_bob = must(store.get_playbooks_for_team(&RequesterInfo::new("bob"), "t1", &options));
        assert_eq!(for_bob.items.len(), 1);
        assert_eq!(for_bob.items[0].id, open.id);

        let for_guest =
            must(store.get_playbooks_for_team(&RequesterInfo::guest("alice"), "t1", &options));
        assert_eq!(for_guest.items.len(), 1);
        assert_eq!(for_guest.items[0].id, restricted.id);

        let for_admin = must(store.get_playbooks_for_team(
            &RequesterInfo::admin("root"),
            "",
            &options,
        ));
        assert_eq!(for_admin.total_count, 0, "admin outside every team sees none without a team filter");
    }

    #[test]
    fn search_matches_normalized_titles() {
        let store = fixture_store();
        must(store.create_playbook(&fixture_playbook("Ziggürat Recovery", "t1", &[])));
        must(store.create_playbook(&fixture_playbook("Database failover", "t1", &[])));
        let found = must(store.get_playbooks_for_team(
            &RequesterInfo::admin("root"),
            "t1",
            &PlaybookFilterOptions {
                search_term: "ziggurat".to_string(),
                per_page: 10,
                ..PlaybookFilterOptions::default()
            },
        ));
        assert_eq!(found.total_count, 1);
        assert_eq!(found.items[0].title, "Ziggürat Recovery");
    }

    #[test]
    fn update_replaces_members_and_archive_hides() {
        let store = fixture_store();
        let mut playbook = must(store.create_playbook(&fixture_playbook("Outage", "t1", &["a"])));
        playbook.member_ids = vec!["b".to_string(), "c".to_string()];
        playbook.checklists.pop();
        must(store.update_playbook(&playbook));

        let fetched = must(store.get_playbook(&playbook.id));
        assert_eq!(fetched.member_ids, vec!["b".to_string(), "c".to_string()]);
        assert_eq!((fetched.num_stages, fetched.num_steps), (1, 2));

        must(store.archive_playbook(&playbook.id));
        assert!(must(store.get_playbooks()).is_empty());
        let err = match store.archive_playbook(&playbook.id) {
            Ok(()) => panic!("second archive should fail"),
            Err(err) => err,
        };
        assert_eq!(classify(&err), ErrorClass::NotFound);
    }
}
