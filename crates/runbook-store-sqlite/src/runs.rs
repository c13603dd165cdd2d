use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use runbook_core::checklist as ops;
use runbook_core::{
    new_id, now_millis, ChecklistItem, ChecklistItemState, FilterOptions, ListResults,
    RequesterInfo, Run, RunStatus, RunStore, StatusPost, TimelineEvent, TimelineEventType,
};

use crate::checklists::{claim_ids, load_checklists, update_item_progress, write_checklists};
use crate::query::{compile_run_query, RUN_COLUMNS};
use crate::{
    collect_rows, conversion_error, invalid_argument, not_found, placeholders, text_values,
    write_error, SqliteStore,
};

pub(crate) fn map_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let status_raw: String = row.get(10)?;
    let current_status = RunStatus::parse(&status_raw).ok_or_else(|| {
        conversion_error(10, Type::Text, format!("invalid run status: {status_raw}"))
    })?;
    Ok(Run {
        id: row.get(0)?,
        name: row.get(1)?,
        summary: row.get(2)?,
        owner_user_id: row.get(3)?,
        reporter_user_id: row.get(4)?,
        team_id: row.get(5)?,
        channel_id: row.get(6)?,
        create_at: row.get(7)?,
        end_at: row.get(8)?,
        delete_at: row.get(9)?,
        current_status,
        last_status_update_at: row.get(11)?,
        playbook_id: row.get(12)?,
        ..Run::default()
    })
}

/// Inserts the run row and its checklist rows. The caller owns the
/// transaction.
pub(crate) fn insert_run(conn: &Connection, run: &Run) -> Result<()> {
    conn.execute(
        "INSERT INTO runs(
            id, name, summary, owner_user_id, reporter_user_id, team_id, channel_id,
            create_at, end_at, delete_at, current_status, last_status_update_at, playbook_id
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            run.id,
            run.name,
            run.summary,
            run.owner_user_id,
            run.reporter_user_id,
            run.team_id,
            run.channel_id,
            run.create_at,
            run.end_at,
            run.delete_at,
            run.current_status.as_str(),
            run.last_status_update_at,
            run.playbook_id,
        ],
    )
    .map_err(|err| {
        write_error(err, || {
            format!("run '{}' or its channel '{}'", run.id, run.channel_id)
        })
    })
    .with_context(|| format!("failed to insert run '{}'", run.id))?;
    write_checklists(conn, &run.id, &run.checklists)
}

fn ensure_run_exists(conn: &Connection, run_id: &str) -> Result<()> {
    let found = conn
        .query_row("SELECT 1 FROM runs WHERE id = ?1", params![run_id], |row| {
            row.get::<_, i64>(0)
        })
        .optional()
        .with_context(|| format!("failed to look up run '{run_id}'"))?;
    if found.is_none() {
        return Err(not_found(format!("run '{run_id}'")));
    }
    Ok(())
}

/// Fills checklists, status posts, timeline events and participants for a
/// page of runs with one query per relation.
fn hydrate(conn: &Connection, runs: &mut [Run]) -> Result<()> {
    if runs.is_empty() {
        return Ok(());
    }
    let run_ids: Vec<String> = runs.iter().map(|run| run.id.clone()).collect();
    let channel_ids: Vec<String> = runs.iter().map(|run| run.channel_id.clone()).collect();

    let mut checklists = load_checklists(conn, &run_ids)?;
    let mut status_posts = load_status_posts(conn, &run_ids)?;
    let mut timeline_events = load_timeline_events(conn, &run_ids)?;
    let participants = load_participants(conn, &channel_ids)?;

    for run in runs.iter_mut() {
        run.checklists = checklists.remove(&run.id).unwrap_or_default();
        run.status_posts = status_posts.remove(&run.id).unwrap_or_default();
        run.timeline_events = timeline_events.remove(&run.id).unwrap_or_default();
        run.participant_ids = participants.get(&run.channel_id).cloned().unwrap_or_default();
    }
    Ok(())
}

fn load_status_posts(
    conn: &Connection,
    run_ids: &[String],
) -> Result<BTreeMap<String, Vec<StatusPost>>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT run_id, post_id, status, create_at, delete_at
         FROM status_posts WHERE run_id IN ({})
         ORDER BY create_at ASC, post_id ASC",
        placeholders(run_ids.len())
    ))?;
    let rows = stmt.query_map(params_from_iter(text_values(run_ids)), |row| {
        let status_raw: String = row.get(2)?;
        let status = RunStatus::parse(&status_raw).ok_or_else(|| {
            conversion_error(2, Type::Text, format!("invalid status post status: {status_raw}"))
        })?;
        Ok((
            row.get::<_, String>(0)?,
            StatusPost {
                id: row.get(1)?,
                status,
                create_at: row.get(3)?,
                delete_at: row.get(4)?,
            },
        ))
    })?;

    let mut grouped: BTreeMap<String, Vec<StatusPost>> = BTreeMap::new();
    for (run_id, post) in collect_rows(rows).context("failed to load status posts")? {
        grouped.entry(run_id).or_default().push(post);
    }
    Ok(grouped)
}

const TIMELINE_COLUMNS: &str = "id, run_id, create_at, delete_at, event_at, event_type, \
    summary, details, post_id, subject_user_id, creator_user_id";

fn map_timeline_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TimelineEvent> {
    let type_raw: String = row.get(5)?;
    let event_type = TimelineEventType::parse(&type_raw).ok_or_else(|| {
        conversion_error(5, Type::Text, format!("invalid timeline event type: {type_raw}"))
    })?;
    Ok(TimelineEvent {
        id: row.get(0)?,
        run_id: row.get(1)?,
        create_at: row.get(2)?,
        delete_at: row.get(3)?,
        event_at: row.get(4)?,
        event_type,
        summary: row.get(6)?,
        details: row.get(7)?,
        post_id: row.get(8)?,
        subject_user_id: row.get(9)?,
        creator_user_id: row.get(10)?,
    })
}

fn load_timeline_events(
    conn: &Connection,
    run_ids: &[String],
) -> Result<BTreeMap<String, Vec<TimelineEvent>>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TIMELINE_COLUMNS} FROM timeline_events
         WHERE delete_at = 0 AND run_id IN ({})
         ORDER BY event_at ASC, id ASC",
        placeholders(run_ids.len())
    ))?;
    let rows = stmt.query_map(params_from_iter(text_values(run_ids)), map_timeline_row)?;

    let mut grouped: BTreeMap<String, Vec<TimelineEvent>> = BTreeMap::new();
    for event in collect_rows(rows).context("failed to load timeline events")? {
        grouped.entry(event.run_id.clone()).or_default().push(event);
    }
    Ok(grouped)
}

fn load_participants(
    conn: &Connection,
    channel_ids: &[String],
) -> Result<BTreeMap<String, Vec<String>>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT cm.channel_id, cm.user_id FROM channel_members cm
         WHERE cm.channel_id IN ({})
           AND NOT EXISTS (SELECT 1 FROM bots b WHERE b.user_id = cm.user_id)
         ORDER BY cm.channel_id ASC, cm.user_id ASC",
        placeholders(channel_ids.len())
    ))?;
    let rows = stmt.query_map(params_from_iter(text_values(channel_ids)), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (channel_id, user_id) in collect_rows(rows).context("failed to load participants")? {
        grouped.entry(channel_id).or_default().push(user_id);
    }
    Ok(grouped)
}

impl SqliteStore {
    /// Loads a run's checklists, applies `edit`, and writes them back in one
    /// transaction.
    fn edit_checklists(
        &self,
        run_id: &str,
        edit: impl FnOnce(&mut Vec<runbook_core::Checklist>) -> Result<()>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("failed to start checklist transaction")?;
        ensure_run_exists(&tx, run_id)?;
        let mut checklists = load_checklists(&tx, &[run_id.to_string()])?
            .remove(run_id)
            .unwrap_or_default();
        edit(&mut checklists)?;
        write_checklists(&tx, run_id, &checklists)?;
        tx.commit().context("failed to commit checklist transaction")?;
        Ok(())
    }

    /// Applies `edit` to one item and stores its progress fields.
    fn edit_item(
        &self,
        run_id: &str,
        checklist_num: usize,
        item_num: usize,
        edit: impl FnOnce(&mut ChecklistItem),
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("failed to start checklist item transaction")?;
        ensure_run_exists(&tx, run_id)?;
        let mut checklists = load_checklists(&tx, &[run_id.to_string()])?
            .remove(run_id)
            .unwrap_or_default();
        let item = ops::item_mut(&mut checklists, checklist_num, item_num)
            .with_context(|| format!("failed to locate checklist item in run '{run_id}'"))?;
        edit(item);
        update_item_progress(&tx, item)?;
        tx.commit()
            .context("failed to commit checklist item transaction")?;
        Ok(())
    }
}

impl RunStore for SqliteStore {
    fn create_run(&self, run: &Run) -> Result<Run> {
        if run.channel_id.is_empty() {
            return Err(invalid_argument("run must be linked to a channel".to_string()));
        }
        if run.team_id.is_empty() {
            return Err(invalid_argument("run must belong to a team".to_string()));
        }

        let mut stored = run.clone();
        if stored.id.is_empty() {
            stored.id = new_id();
        }
        if stored.create_at == 0 {
            stored.create_at = now_millis();
        }
        ops::reassign_ids(&mut stored.checklists);
        stored.participant_ids.clear();
        stored.status_posts.clear();
        stored.timeline_events.clear();

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("failed to start run transaction")?;
        insert_run(&tx, &stored)?;
        tx.commit().context("failed to commit run transaction")?;
        Ok(stored)
    }

    fn update_run(&self, run: &Run) -> Result<()> {
        if run.id.is_empty() {
            return Err(invalid_argument("run id must not be empty".to_string()));
        }
        let mut checklists = run.checklists.clone();

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("failed to start run transaction")?;
        claim_ids(&tx, &run.id, &mut checklists)?;
        let updated = tx
            .execute(
                "UPDATE runs
                 SET summary = ?1, owner_user_id = ?2, reporter_user_id = ?3, end_at = ?4,
                     delete_at = ?5, current_status = ?6, last_status_update_at = ?7,
                     playbook_id = ?8
                 WHERE id = ?9",
                params![
                    run.summary,
                    run.owner_user_id,
                    run.reporter_user_id,
                    run.end_at,
                    run.delete_at,
                    run.current_status.as_str(),
                    run.last_status_update_at,
                    run.playbook_id,
                    run.id,
                ],
            )
            .with_context(|| format!("failed to update run '{}'", run.id))?;
        if updated == 0 {
            return Err(not_found(format!("run '{}'", run.id)));
        }
        write_checklists(&tx, &run.id, &checklists)?;
        tx.commit().context("failed to commit run transaction")?;
        Ok(())
    }

    fn get_run(&self, id: &str) -> Result<Run> {
        if id.is_empty() {
            return Err(not_found("run with empty id".to_string()));
        }
        let conn = self.conn()?;
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs r WHERE r.id = ?1"),
                params![id],
                map_run_row,
            )
            .optional()
            .with_context(|| format!("failed to get run by id '{id}'"))?
            .ok_or_else(|| not_found(format!("run '{id}'")))?;

        let mut runs = vec![run];
        hydrate(&conn, &mut runs).with_context(|| format!("failed to get run by id '{id}'"))?;
        runs.pop()
            .ok_or_else(|| not_found(format!("run '{id}'")))
    }

    fn list_runs(
        &self,
        requester: &RequesterInfo,
        options: &FilterOptions,
    ) -> Result<ListResults<Run>> {
        let query = compile_run_query(requester, options, now_millis())
            .context("failed to compile run query")?;
        tracing::debug!(sql = %query.results_sql(), "listing runs");

        let conn = self.conn()?;
        let total_count: i64 = conn
            .query_row(&query.count_sql(), params_from_iter(query.params.iter()), |row| {
                row.get(0)
            })
            .context("failed to count runs")?;

        let mut stmt = conn.prepare(&query.results_sql())?;
        let rows = stmt.query_map(params_from_iter(query.params.iter()), map_run_row)?;
        let mut runs = collect_rows(rows).context("failed to list runs")?;
        hydrate(&conn, &mut runs).context("failed to hydrate listed runs")?;

        Ok(query.paging.results(runs, total_count))
    }

    fn get_run_id_for_channel(&self, channel_id: &str) -> Result<String> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id FROM runs WHERE channel_id = ?1",
            params![channel_id],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .with_context(|| format!("failed to get run for channel '{channel_id}'"))?
        .ok_or_else(|| not_found(format!("run for channel '{channel_id}'")))
    }

    fn get_owners(
        &self,
        requester: &RequesterInfo,
        options: &FilterOptions,
    ) -> Result<Vec<String>> {
        let query = compile_run_query(requester, options, now_millis())
            .context("failed to compile owner query")?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&query.distinct_sql("r.owner_user_id"))?;
        let rows = stmt.query_map(params_from_iter(query.params.iter()), |row| {
            row.get::<_, String>(0)
        })?;
        collect_rows(rows).context("failed to list run owners")
    }

    fn follow(&self, run_id: &str, user_id: &str) -> Result<()> {
        let conn = self.conn()?;
        ensure_run_exists(&conn, run_id)?;
        conn.execute(
            "INSERT INTO run_participants(run_id, user_id, is_follower) VALUES (?1, ?2, 1)
             ON CONFLICT(run_id, user_id) DO UPDATE SET is_follower = 1",
            params![run_id, user_id],
        )
        .with_context(|| format!("failed to follow run '{run_id}' for '{user_id}'"))?;
        Ok(())
    }

    fn unfollow(&self, run_id: &str, user_id: &str) -> Result<()> {
        let conn = self.conn()?;
        ensure_run_exists(&conn, run_id)?;
        conn.execute(
            "INSERT INTO run_participants(run_id, user_id, is_follower) VALUES (?1, ?2, 0)
             ON CONFLICT(run_id, user_id) DO UPDATE SET is_follower = 0",
            params![run_id, user_id],
        )
        .with_context(|| format!("failed to unfollow run '{run_id}' for '{user_id}'"))?;
        Ok(())
    }

    fn get_followers(&self, run_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id FROM run_participants
             WHERE run_id = ?1 AND is_follower = 1
             ORDER BY user_id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
        collect_rows(rows).with_context(|| format!("failed to get followers of run '{run_id}'"))
    }

    fn update_status(&self, run_id: &str, post: &StatusPost) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("failed to start status transaction")?;
        let end_at: i64 = tx
            .query_row(
                "SELECT end_at FROM runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up run '{run_id}'"))?
            .ok_or_else(|| not_found(format!("run '{run_id}'")))?;

        tx.execute(
            "INSERT INTO status_posts(run_id, post_id, status, create_at, delete_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, post.id, post.status.as_str(), post.create_at, post.delete_at],
        )
        .map_err(|err| write_error(err, || format!("status post '{}'", post.id)))
        .with_context(|| format!("failed to record status post for run '{run_id}'"))?;

        let end_at = match (post.status.is_terminal(), end_at) {
            (true, 0) => post.create_at,
            (true, existing) => existing,
            (false, _) => 0,
        };
        tx.execute(
            "UPDATE runs SET current_status = ?1, last_status_update_at = ?2, end_at = ?3
             WHERE id = ?4",
            params![post.status.as_str(), post.create_at, end_at, run_id],
        )
        .with_context(|| format!("failed to update status of run '{run_id}'"))?;
        tx.commit().context("failed to commit status transaction")?;
        Ok(())
    }

    fn create_timeline_event(&self, event: &TimelineEvent) -> Result<TimelineEvent> {
        let mut stored = event.clone();
        if stored.id.is_empty() {
            stored.id = new_id();
        }
        if stored.create_at == 0 {
            stored.create_at = now_millis();
        }
        if stored.event_at == 0 {
            stored.event_at = stored.create_at;
        }

        let conn = self.conn()?;
        ensure_run_exists(&conn, &stored.run_id)?;
        conn.execute(
            &format!(
                "INSERT INTO timeline_events({TIMELINE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                stored.id,
                stored.run_id,
                stored.create_at,
                stored.delete_at,
                stored.event_at,
                stored.event_type.as_str(),
                stored.summary,
                stored.details,
                stored.post_id,
                stored.subject_user_id,
                stored.creator_user_id,
            ],
        )
        .map_err(|err| write_error(err, || format!("timeline event '{}'", stored.id)))
        .with_context(|| format!("failed to create timeline event for run '{}'", stored.run_id))?;
        Ok(stored)
    }

    fn update_timeline_event(&self, event: &TimelineEvent) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE timeline_events
                 SET delete_at = ?1, event_at = ?2, event_type = ?3, summary = ?4,
                     details = ?5, post_id = ?6, subject_user_id = ?7, creator_user_id = ?8
                 WHERE id = ?9 AND run_id = ?10",
                params![
                    event.delete_at,
                    event.event_at,
                    event.event_type.as_str(),
                    event.summary,
                    event.details,
                    event.post_id,
                    event.subject_user_id,
                    event.creator_user_id,
                    event.id,
                    event.run_id,
                ],
            )
            .with_context(|| format!("failed to update timeline event '{}'", event.id))?;
        if updated == 0 {
            return Err(not_found(format!("timeline event '{}'", event.id)));
        }
        Ok(())
    }

    fn get_timeline_event(&self, run_id: &str, event_id: &str) -> Result<TimelineEvent> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {TIMELINE_COLUMNS} FROM timeline_events
                 WHERE id = ?1 AND run_id = ?2 AND delete_at = 0"
            ),
            params![event_id, run_id],
            map_timeline_row,
        )
        .optional()
        .with_context(|| format!("failed to get timeline event '{event_id}'"))?
        .ok_or_else(|| not_found(format!("timeline event '{event_id}' in run '{run_id}'")))
    }

    fn get_checklist_item(
        &self,
        run_id: &str,
        checklist_num: usize,
        item_num: usize,
    ) -> Result<ChecklistItem> {
        let conn = self.conn()?;
        ensure_run_exists(&conn, run_id)?;
        let checklists = load_checklists(&conn, &[run_id.to_string()])?
            .remove(run_id)
            .unwrap_or_default();
        let item = ops::item(&checklists, checklist_num, item_num)
            .with_context(|| format!("failed to get checklist item in run '{run_id}'"))?;
        Ok(item.clone())
    }

    fn set_checklist_item_state(
        &self,
        run_id: &str,
        checklist_num: usize,
        item_num: usize,
        state: ChecklistItemState,
    ) -> Result<()> {
        self.edit_item(run_id, checklist_num, item_num, |item| {
            item.state = state;
            item.state_modified = now_millis();
        })
    }

    fn set_checklist_item_assignee(
        &self,
        run_id: &str,
        checklist_num: usize,
        item_num: usize,
        assignee_id: &str,
    ) -> Result<()> {
        self.edit_item(run_id, checklist_num, item_num, |item| {
            item.assignee_id = assignee_id.to_string();
            item.assignee_modified = now_millis();
        })
    }

    fn move_checklist(&self, run_id: &str, source: usize, destination: usize) -> Result<()> {
        self.edit_checklists(run_id, |checklists| {
            ops::move_checklist(checklists, source, destination)
                .with_context(|| format!("failed to move checklist in run '{run_id}'"))
        })
    }

    fn move_checklist_item(
        &self,
        run_id: &str,
        source_checklist: usize,
        source_item: usize,
        destination_checklist: usize,
        destination_item: usize,
    ) -> Result<()> {
        self.edit_checklists(run_id, |checklists| {
            ops::move_item(
                checklists,
                source_checklist,
                source_item,
                destination_checklist,
                destination_item,
            )
            .with_context(|| format!("failed to move checklist item in run '{run_id}'"))
        })
    }

    fn set_viewed_channel(&self, user_id: &str, channel_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO viewed_channels(channel_id, user_id) VALUES (?1, ?2)",
            params![channel_id, user_id],
        )
        .map_err(|err| {
            write_error(err, || {
                format!("view of channel '{channel_id}' by '{user_id}'")
            })
        })
        .with_context(|| format!("failed to record view of channel '{channel_id}'"))?;
        Ok(())
    }

    fn has_viewed_channel(&self, user_id: &str, channel_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM viewed_channels WHERE channel_id = ?1 AND user_id = ?2)",
            params![channel_id, user_id],
            |row| row.get::<_, bool>(0),
        )
        .with_context(|| format!("failed to check view of channel '{channel_id}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture_run, fixture_store, must};

    #[test]
    fn legacy_commander_changed_events_read_as_owner_changed() {
        let store = fixture_store();
        let run = must(store.create_run(&fixture_run("horse", "team1", "c1")));
        {
            let conn = must(store.conn());
            if let Err(err) = conn.execute(
                "INSERT INTO timeline_events(id, run_id, create_at, event_at, event_type)
                 VALUES ('ev1', ?1, 10, 10, 'commander_changed')",
                params![run.id],
            ) {
                panic!("seed failed: {err}");
            }
        }
        let event = must(store.get_timeline_event(&run.id, "ev1"));
        assert_eq!(event.event_type, TimelineEventType::OwnerChanged);
        assert_eq!(must(store.get_run(&run.id)).timeline_events.len(), 1);
    }

    #[test]
    fn hydration_batches_checklists_for_many_runs() {
        let store = fixture_store();
        let first = must(store.create_run(&fixture_run("a", "team1", "c1")));
        let second = must(store.create_run(&fixture_run("b", "team1", "c2")));
        let conn = must(store.conn());
        let mut runs = vec![
            Run {
                id: first.id.clone(),
                channel_id: "c1".to_string(),
                ..Run::default()
            },
            Run {
                id: second.id.clone(),
                channel_id: "c2".to_string(),
                ..Run::default()
            },
        ];
        must(hydrate(&conn, &mut runs));
        assert_eq!(runs[0].checklists, first.checklists);
        assert_eq!(runs[1].checklists, second.checklists);
    }
}
