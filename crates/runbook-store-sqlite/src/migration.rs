//! One-shot move of legacy key/value runs and playbooks into the relational
//! tables.
//!
//! The legacy layout keeps an index blob per entity kind plus one JSON blob
//! per record. Records the index names but that are missing or unreadable
//! are skipped and reported; everything else is inserted in a single
//! transaction together with the [`KV_MIGRATION_VERSION`] marker, so a failed
//! attempt leaves no partial rows and can simply be retried.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use runbook_core::checklist::populate_ids;
use runbook_core::{
    now_millis, Checklist, ChecklistItem, ChecklistItemState, KvStore, Playbook, Run, RunStatus,
};

use crate::checklists::claim_ids;
use crate::playbooks::insert_playbook;
use crate::runs::insert_run;
use crate::schema::KV_MIGRATION_VERSION;
use crate::{record_version, version_applied, SqliteStore};

pub const PLAYBOOK_INDEX_KEY: &str = "playbook_index";
pub const RUN_INDEX_KEY: &str = "run_index";
pub const PLAYBOOK_KEY_PREFIX: &str = "playbook_";
pub const RUN_KEY_PREFIX: &str = "run_";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    NotStarted,
    InProgress,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SkippedRecord {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationReport {
    pub state: MigrationState,
    pub target_version: i64,
    pub playbooks_migrated: usize,
    pub runs_migrated: usize,
    pub skipped: Vec<SkippedRecord>,
}

impl MigrationReport {
    fn committed(playbooks_migrated: usize, runs_migrated: usize, skipped: Vec<SkippedRecord>) -> Self {
        Self {
            state: MigrationState::Committed,
            target_version: KV_MIGRATION_VERSION,
            playbooks_migrated,
            runs_migrated,
            skipped,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct LegacyPlaybookIndex {
    #[serde(default)]
    playbook_ids: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyRunIndex {
    #[serde(default)]
    run_ids: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyChecklistItem {
    id: String,
    title: String,
    state: String,
    #[serde(deserialize_with = "legacy_millis")]
    state_modified: i64,
    assignee_id: String,
    #[serde(deserialize_with = "legacy_millis")]
    assignee_modified: i64,
    command: String,
    #[serde(deserialize_with = "legacy_millis")]
    command_last_run: i64,
    description: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyChecklist {
    id: String,
    title: String,
    items: Option<Vec<LegacyChecklistItem>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyPlaybook {
    id: String,
    title: String,
    team_id: String,
    create_public_incident: bool,
    checklists: Option<Vec<LegacyChecklist>>,
    member_ids: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyRun {
    id: String,
    name: String,
    is_active: bool,
    commander_user_id: String,
    team_id: String,
    primary_channel_id: String,
    created_at: i64,
    ended_at: i64,
    playbook_id: String,
    playbook: Option<LegacyPlaybook>,
}

/// Accepts epoch milliseconds, an RFC 3339 timestamp, or null. Pre-epoch
/// instants (such as a zero time value) become 0.
fn legacy_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    let millis = match Option::<Raw>::deserialize(deserializer)? {
        None => 0,
        Some(Raw::Millis(millis)) => millis,
        Some(Raw::Text(text)) if text.is_empty() => 0,
        Some(Raw::Text(text)) => {
            let parsed = OffsetDateTime::parse(&text, &Rfc3339).map_err(serde::de::Error::custom)?;
            i64::try_from(parsed.unix_timestamp_nanos() / 1_000_000)
                .map_err(serde::de::Error::custom)?
        }
    };
    Ok(millis.max(0))
}

fn convert_checklists(legacy: Option<Vec<LegacyChecklist>>, key: &str) -> Vec<Checklist> {
    let mut checklists: Vec<Checklist> = legacy
        .unwrap_or_default()
        .into_iter()
        .map(|checklist| Checklist {
            id: checklist.id,
            title: checklist.title,
            items: checklist
                .items
                .unwrap_or_default()
                .into_iter()
                .map(|item| convert_item(item, key))
                .collect(),
        })
        .collect();
    populate_ids(&mut checklists);
    checklists
}

fn convert_item(item: LegacyChecklistItem, key: &str) -> ChecklistItem {
    let state = ChecklistItemState::parse(&item.state).unwrap_or_else(|| {
        tracing::warn!(key, state = %item.state, "unknown legacy checklist item state, treating as open");
        ChecklistItemState::Open
    });
    ChecklistItem {
        id: item.id,
        title: item.title,
        state,
        state_modified: item.state_modified,
        assignee_id: item.assignee_id,
        assignee_modified: item.assignee_modified,
        command: item.command,
        command_last_run: item.command_last_run,
        description: item.description,
        due_date: 0,
    }
}

fn convert_playbook(legacy: LegacyPlaybook, key: &str, now: i64) -> Playbook {
    let mut playbook = Playbook {
        id: legacy.id,
        title: legacy.title,
        team_id: legacy.team_id,
        create_public_run: legacy.create_public_incident,
        create_at: now,
        checklists: convert_checklists(legacy.checklists, key),
        member_ids: legacy.member_ids.unwrap_or_default(),
        ..Playbook::default()
    };
    playbook.refresh_counts();
    playbook
}

fn convert_run(legacy: LegacyRun, key: &str) -> Run {
    let (current_status, end_at) = if legacy.is_active {
        (RunStatus::InProgress, 0)
    } else if legacy.ended_at > 0 {
        (RunStatus::Finished, legacy.ended_at)
    } else {
        (RunStatus::Finished, legacy.created_at)
    };
    let (embedded_playbook_id, checklists) = match legacy.playbook {
        Some(playbook) => (playbook.id, convert_checklists(playbook.checklists, key)),
        None => (String::new(), Vec::new()),
    };
    let playbook_id = if legacy.playbook_id.is_empty() {
        embedded_playbook_id
    } else {
        legacy.playbook_id
    };
    Run {
        id: legacy.id,
        name: legacy.name,
        owner_user_id: legacy.commander_user_id.clone(),
        reporter_user_id: legacy.commander_user_id,
        team_id: legacy.team_id,
        channel_id: legacy.primary_channel_id,
        create_at: legacy.created_at,
        end_at,
        current_status,
        playbook_id,
        checklists,
        ..Run::default()
    }
}

/// Reads and parses an index blob. A missing index means there is nothing of
/// that kind to migrate; a malformed one aborts the migration.
fn read_index<T>(kv: &dyn KvStore, key: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    match kv.get(key).with_context(|| format!("failed to read legacy index '{key}'"))? {
        None => Ok(T::default()),
        Some(raw) => serde_json::from_slice(&raw)
            .with_context(|| format!("malformed legacy index '{key}'")),
    }
}

/// Fetches and parses one record. `None` means the record was skipped and
/// the reason has been added to `skipped`.
fn read_record<T>(kv: &dyn KvStore, key: &str, skipped: &mut Vec<SkippedRecord>) -> Option<T>
where
    T: for<'de> Deserialize<'de>,
{
    let reason = match kv.get(key) {
        Ok(Some(raw)) => match serde_json::from_slice(&raw) {
            Ok(record) => return Some(record),
            Err(err) => format!("malformed record: {err}"),
        },
        Ok(None) => "record missing".to_string(),
        Err(err) => format!("read failed: {err:#}"),
    };
    tracing::warn!(key, %reason, "skipping legacy record");
    skipped.push(SkippedRecord {
        key: key.to_string(),
        reason,
    });
    None
}

fn skip(skipped: &mut Vec<SkippedRecord>, key: &str, reason: &str) {
    tracing::warn!(key, reason, "skipping legacy record");
    skipped.push(SkippedRecord {
        key: key.to_string(),
        reason: reason.to_string(),
    });
}

struct Collected {
    playbooks: Vec<Playbook>,
    runs: Vec<Run>,
    skipped: Vec<SkippedRecord>,
}

fn collect(kv: &dyn KvStore) -> Result<Collected> {
    let playbook_index: LegacyPlaybookIndex = read_index(kv, PLAYBOOK_INDEX_KEY)?;
    let run_index: LegacyRunIndex = read_index(kv, RUN_INDEX_KEY)?;
    let now = now_millis();
    let mut skipped = Vec::new();

    let mut playbooks = Vec::new();
    for id in playbook_index.playbook_ids.unwrap_or_default() {
        let key = format!("{PLAYBOOK_KEY_PREFIX}{id}");
        let Some(legacy) = read_record::<LegacyPlaybook>(kv, &key, &mut skipped) else {
            continue;
        };
        if id.is_empty() || legacy.id != id {
            skip(&mut skipped, &key, "record id does not match index");
            continue;
        }
        playbooks.push(convert_playbook(legacy, &key, now));
    }

    let mut runs = Vec::new();
    for id in run_index.run_ids.unwrap_or_default() {
        let key = format!("{RUN_KEY_PREFIX}{id}");
        let Some(legacy) = read_record::<LegacyRun>(kv, &key, &mut skipped) else {
            continue;
        };
        if id.is_empty() || legacy.id != id {
            skip(&mut skipped, &key, "record id does not match index");
            continue;
        }
        runs.push(convert_run(legacy, &key));
    }

    Ok(Collected {
        playbooks,
        runs,
        skipped,
    })
}

impl SqliteStore {
    pub fn migration_state(&self) -> Result<MigrationState> {
        self.kv_migration
            .lock()
            .map(|state| *state)
            .map_err(|_| anyhow!("migration state lock poisoned"))
    }

    fn set_migration_state(&self, next: MigrationState) -> Result<()> {
        let mut state = self
            .kv_migration
            .lock()
            .map_err(|_| anyhow!("migration state lock poisoned"))?;
        tracing::info!(from = ?*state, to = ?next, "kv migration state change");
        *state = next;
        Ok(())
    }

    /// Moves every legacy record from `kv` into the relational tables.
    ///
    /// Runs once: when the version marker is already present the call does
    /// nothing and reports `Committed` with zero counts. On failure nothing
    /// is written, the state becomes `RolledBack`, and a later call retries.
    pub fn migrate_kv(&self, kv: &dyn KvStore) -> Result<MigrationReport> {
        let already_applied = {
            let conn = self.conn()?;
            version_applied(&conn, KV_MIGRATION_VERSION)?
        };
        if already_applied {
            self.set_migration_state(MigrationState::Committed)?;
            return Ok(MigrationReport::committed(0, 0, Vec::new()));
        }

        self.set_migration_state(MigrationState::InProgress)?;
        match self.apply_kv_migration(kv) {
            Ok(report) => {
                self.set_migration_state(MigrationState::Committed)?;
                tracing::info!(
                    playbooks = report.playbooks_migrated,
                    runs = report.runs_migrated,
                    skipped = report.skipped.len(),
                    "kv migration committed"
                );
                Ok(report)
            }
            Err(err) => {
                self.set_migration_state(MigrationState::RolledBack)?;
                tracing::warn!(error = %format!("{err:#}"), "kv migration rolled back");
                Err(err.context("kv to relational migration rolled back"))
            }
        }
    }

    fn apply_kv_migration(&self, kv: &dyn KvStore) -> Result<MigrationReport> {
        // Read everything before taking the connection lock; `kv` may be this store.
        let mut collected = collect(kv)?;

        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("failed to start kv migration transaction")?;
        for playbook in &collected.playbooks {
            insert_playbook(&tx, playbook)
                .with_context(|| format!("failed to migrate playbook '{}'", playbook.id))?;
        }
        for run in &mut collected.runs {
            // Legacy runs embed copies of their playbook's checklists, so IDs
            // can repeat across runs.
            let replaced = claim_ids(&tx, &run.id, &mut run.checklists)
                .with_context(|| format!("failed to assign checklist ids for run '{}'", run.id))?;
            if replaced > 0 {
                tracing::warn!(run_id = %run.id, replaced, "reassigned clashing legacy checklist ids");
            }
            insert_run(&tx, run).with_context(|| format!("failed to migrate run '{}'", run.id))?;
        }
        record_version(&tx, KV_MIGRATION_VERSION)
            .context("failed to record kv migration version")?;
        tx.commit()
            .context("failed to commit kv migration transaction")?;

        Ok(MigrationReport::committed(
            collected.playbooks.len(),
            collected.runs.len(),
            collected.skipped,
        ))
    }
}
