use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Statement};
use runbook_core::position::{self, ChecklistRow, ItemRow};
use runbook_core::{new_id, Checklist, ChecklistItem, ChecklistItemState};

use crate::{collect_rows, conversion_error, placeholders, text_values, write_error};

/// Keeps supplied checklist and item IDs where possible. An ID that is
/// empty, repeated within `checklists`, or stored under another run is
/// replaced with a fresh one. Returns how many non-empty IDs were replaced.
pub(crate) fn claim_ids(conn: &Connection, run_id: &str, checklists: &mut [Checklist]) -> Result<usize> {
    let mut checklist_owner = conn.prepare_cached("SELECT run_id FROM run_checklists WHERE id = ?1")?;
    let mut item_owner = conn.prepare_cached("SELECT run_id FROM run_checklist_items WHERE id = ?1")?;
    let mut checklist_ids = BTreeSet::new();
    let mut item_ids = BTreeSet::new();
    let mut replaced = 0;
    for checklist in checklists {
        if claim(&mut checklist.id, &mut checklist_ids, &mut checklist_owner, run_id)? {
            replaced += 1;
        }
        for item in &mut checklist.items {
            if claim(&mut item.id, &mut item_ids, &mut item_owner, run_id)? {
                replaced += 1;
            }
        }
    }
    Ok(replaced)
}

fn claim(
    id: &mut String,
    seen: &mut BTreeSet<String>,
    owner: &mut Statement<'_>,
    run_id: &str,
) -> Result<bool> {
    if !id.is_empty() && !seen.contains(id.as_str()) {
        let stored_under: Option<String> = owner
            .query_row(params![id.as_str()], |row| row.get(0))
            .optional()
            .with_context(|| format!("failed to look up owner of checklist id '{id}'"))?;
        if !stored_under.is_some_and(|stored| stored != run_id) {
            seen.insert(id.clone());
            return Ok(false);
        }
    }
    let supplied = !id.is_empty();
    *id = new_id();
    seen.insert(id.clone());
    Ok(supplied)
}

/// Replaces every checklist row of `run_id` with `checklists`. IDs must
/// already be populated.
pub(crate) fn write_checklists(conn: &Connection, run_id: &str, checklists: &[Checklist]) -> Result<()> {
    let encoded = position::encode(run_id, checklists)
        .with_context(|| format!("failed to encode checklists for run '{run_id}'"))?;

    conn.execute(
        "DELETE FROM run_checklist_items WHERE run_id = ?1",
        params![run_id],
    )
    .with_context(|| format!("failed to clear checklist items for run '{run_id}'"))?;
    conn.execute("DELETE FROM run_checklists WHERE run_id = ?1", params![run_id])
        .with_context(|| format!("failed to clear checklists for run '{run_id}'"))?;

    let mut insert_checklist = conn.prepare_cached(
        "INSERT INTO run_checklists(id, run_id, title, position) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for row in &encoded.checklists {
        insert_checklist
            .execute(params![row.id, row.parent_id, row.title, row.position])
            .map_err(|err| write_error(err, || format!("checklist '{}'", row.id)))
            .with_context(|| format!("failed to insert checklist for run '{run_id}'"))?;
    }

    let mut insert_item = conn.prepare_cached(
        "INSERT INTO run_checklist_items(
            id, checklist_id, run_id, position, title, state, state_modified,
            assignee_id, assignee_modified, command, command_last_run, description, due_date
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
    )?;
    for row in &encoded.items {
        let item = &row.item;
        insert_item
            .execute(params![
                item.id,
                row.parent_id,
                run_id,
                row.position,
                item.title,
                item.state.as_str(),
                item.state_modified,
                item.assignee_id,
                item.assignee_modified,
                item.command,
                item.command_last_run,
                item.description,
                item.due_date,
            ])
            .map_err(|err| write_error(err, || format!("checklist item '{}'", item.id)))
            .with_context(|| format!("failed to insert checklist item for run '{run_id}'"))?;
    }
    Ok(())
}

/// Loads and decodes checklists for all `run_ids` in two queries.
pub(crate) fn load_checklists(
    conn: &Connection,
    run_ids: &[String],
) -> Result<BTreeMap<String, Vec<Checklist>>> {
    if run_ids.is_empty() {
        return Ok(BTreeMap::new());
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT id, run_id, title, position FROM run_checklists WHERE run_id IN ({})",
        placeholders(run_ids.len())
    ))?;
    let rows = stmt.query_map(params_from_iter(text_values(run_ids)), |row| {
        Ok(ChecklistRow {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            title: row.get(2)?,
            position: row.get(3)?,
        })
    })?;
    let checklist_rows = collect_rows(rows).context("failed to load checklists")?;

    let mut stmt = conn.prepare(&format!(
        "SELECT checklist_id, position, id, title, state, state_modified, assignee_id,
                assignee_modified, command, command_last_run, description, due_date
         FROM run_checklist_items WHERE run_id IN ({})",
        placeholders(run_ids.len())
    ))?;
    let rows = stmt.query_map(params_from_iter(text_values(run_ids)), map_item_row)?;
    let item_rows = collect_rows(rows).context("failed to load checklist items")?;

    let decoded = position::decode(checklist_rows, item_rows)
        .context("failed to decode stored checklist positions")?;
    Ok(decoded)
}

fn map_item_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRow> {
    let state_raw: String = row.get(4)?;
    let state = ChecklistItemState::parse(&state_raw).ok_or_else(|| {
        conversion_error(4, Type::Text, format!("invalid checklist item state: {state_raw}"))
    })?;
    Ok(ItemRow {
        parent_id: row.get(0)?,
        position: row.get(1)?,
        item: ChecklistItem {
            id: row.get(2)?,
            title: row.get(3)?,
            state,
            state_modified: row.get(5)?,
            assignee_id: row.get(6)?,
            assignee_modified: row.get(7)?,
            command: row.get(8)?,
            command_last_run: row.get(9)?,
            description: row.get(10)?,
            due_date: row.get(11)?,
        },
    })
}

/// Writes the per-item progress fields of one already-stored item.
pub(crate) fn update_item_progress(conn: &Connection, item: &ChecklistItem) -> Result<()> {
    conn.execute(
        "UPDATE run_checklist_items
         SET state = ?1, state_modified = ?2, assignee_id = ?3, assignee_modified = ?4,
             command_last_run = ?5
         WHERE id = ?6",
        params![
            item.state.as_str(),
            item.state_modified,
            item.assignee_id,
            item.assignee_modified,
            item.command_last_run,
            item.id,
        ],
    )
    .with_context(|| format!("failed to update checklist item '{}'", item.id))?;
    Ok(())
}
