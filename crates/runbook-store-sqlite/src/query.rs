//! Compiles filter options into a paged result query and a matching count
//! query. Both render the same `WHERE` clause with the same parameters, so
//! totals and page boundaries always agree.

use rusqlite::types::Value;
use runbook_core::{
    search, FilterOptions, Paging, PlaybookFilterOptions, PlaybookSortField, RequesterInfo,
    RunbookError, SortField,
};

use crate::permissions::{playbook_visibility, run_visibility, team_limit};
use crate::NORMALIZE_FN;

pub(crate) const RUN_COLUMNS: &str = "r.id, r.name, r.summary, r.owner_user_id, \
    r.reporter_user_id, r.team_id, r.channel_id, r.create_at, r.end_at, r.delete_at, \
    r.current_status, r.last_status_update_at, r.playbook_id";

pub(crate) const PLAYBOOK_COLUMNS: &str = "p.id, p.title, p.description, p.team_id, \
    p.create_public_run, p.create_at, p.delete_at, p.num_stages, p.num_steps, \
    p.checklists_json, p.broadcast_channel_id, p.broadcast_enabled, \
    p.webhook_on_creation_url, p.webhook_on_status_update_url";

/// A SQL boolean expression with its positional (`?`) parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Predicate {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhereClause {
    predicates: Vec<Predicate>,
}

impl WhereClause {
    pub fn and(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }

    #[must_use]
    pub fn sql(&self) -> String {
        if self.predicates.is_empty() {
            return "1 = 1".to_string();
        }
        self.predicates
            .iter()
            .map(|predicate| format!("({})", predicate.sql))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    #[must_use]
    pub fn params(&self) -> Vec<Value> {
        self.predicates
            .iter()
            .flat_map(|predicate| predicate.params.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    from: &'static str,
    columns: &'static str,
    pub where_sql: String,
    pub params: Vec<Value>,
    pub order_by: String,
    pub paging: Paging,
}

impl CompiledQuery {
    #[must_use]
    pub fn results_sql(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT {} OFFSET {}",
            self.columns,
            self.from,
            self.where_sql,
            self.order_by,
            self.paging.per_page,
            self.paging.offset()
        )
    }

    #[must_use]
    pub fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM {} WHERE {}", self.from, self.where_sql)
    }

    /// Distinct values of `column` over the filtered set, ignoring paging.
    #[must_use]
    pub fn distinct_sql(&self, column: &str) -> String {
        format!(
            "SELECT DISTINCT {column} FROM {} WHERE {} ORDER BY {column}",
            self.from, self.where_sql
        )
    }
}

/// Validates `options` and compiles the run queries. `now` (epoch ms) closes
/// open-ended time windows.
///
/// # Errors
/// Returns [`RunbookError::UnsupportedSortField`],
/// [`RunbookError::UnsupportedDirection`] or [`RunbookError::InvalidArgument`]
/// before any SQL is produced.
pub fn compile_run_query(
    requester: &RequesterInfo,
    options: &FilterOptions,
    now: i64,
) -> Result<CompiledQuery, RunbookError> {
    let sort = options.sort_field()?;
    let direction = options.sort_direction()?;
    let statuses = options.status_set()?;

    let mut clause = WhereClause::default();
    clause.and(team_limit(requester, &options.team_id, "r.team_id"));
    if let Some(visibility) = run_visibility(requester) {
        clause.and(visibility);
    }
    if !options.owner_id.is_empty() {
        clause.and(Predicate::new(
            "r.owner_user_id = ?",
            vec![Value::Text(options.owner_id.clone())],
        ));
    }
    if !options.playbook_id.is_empty() {
        clause.and(Predicate::new(
            "r.playbook_id = ?",
            vec![Value::Text(options.playbook_id.clone())],
        ));
    }
    if !statuses.is_empty() {
        clause.and(Predicate::new(
            format!("r.current_status IN ({})", crate::placeholders(statuses.len())),
            statuses
                .iter()
                .map(|status| Value::Text(status.as_str().to_string()))
                .collect(),
        ));
    }
    for member in [&options.participant_id, &options.member_id] {
        if !member.is_empty() {
            clause.and(Predicate::new(
                "EXISTS (SELECT 1 FROM channel_members cm
                    WHERE cm.channel_id = r.channel_id AND cm.user_id = ?)",
                vec![Value::Text(member.to_lowercase())],
            ));
        }
    }
    if !options.search_term.trim().is_empty() {
        clause.and(search_predicate("r.name", &options.search_term));
    }
    if options.active_gte > 0 || options.active_lt > 0 {
        let end = if options.active_lt > 0 { options.active_lt } else { now };
        clause.and(Predicate::new(
            "(r.end_at >= ? OR r.end_at = 0) AND r.create_at < ?",
            vec![Value::Integer(options.active_gte), Value::Integer(end)],
        ));
    }
    if options.started_gte > 0 || options.started_lt > 0 {
        let end = if options.started_lt > 0 { options.started_lt } else { now };
        clause.and(Predicate::new(
            "r.create_at >= ? AND r.create_at < ?",
            vec![Value::Integer(options.started_gte), Value::Integer(end)],
        ));
    }

    let column = match sort {
        SortField::CreateAt => "r.create_at",
        SortField::Id => "r.id",
        SortField::Name => "r.name",
        SortField::OwnerUserId => "r.owner_user_id",
        SortField::TeamId => "r.team_id",
        SortField::EndAt => "r.end_at",
        SortField::Status => "r.current_status",
        SortField::LastStatusUpdateAt => "r.last_status_update_at",
    };

    Ok(CompiledQuery {
        from: "runs r",
        columns: RUN_COLUMNS,
        where_sql: clause.sql(),
        params: clause.params(),
        order_by: order_by(column, direction.as_sql(), "r.id"),
        paging: options.paging(),
    })
}

/// Compiles the playbook listing for a team. Archived playbooks are excluded.
///
/// # Errors
/// Returns [`RunbookError::UnsupportedSortField`] or
/// [`RunbookError::UnsupportedDirection`] for bad sort options.
pub fn compile_playbook_query(
    requester: &RequesterInfo,
    team_id: &str,
    options: &PlaybookFilterOptions,
) -> Result<CompiledQuery, RunbookError> {
    let sort = PlaybookSortField::parse(&options.sort)?;
    let direction = runbook_core::SortDirection::parse(&options.direction)?;

    let mut clause = WhereClause::default();
    clause.and(Predicate::new("p.delete_at = 0", Vec::new()));
    clause.and(team_limit(requester, team_id, "p.team_id"));
    if let Some(visibility) = playbook_visibility(requester) {
        clause.and(visibility);
    }
    if !options.search_term.trim().is_empty() {
        clause.and(search_predicate("p.title", &options.search_term));
    }

    let column = match sort {
        PlaybookSortField::Id => "p.id",
        PlaybookSortField::Title => "p.title",
        PlaybookSortField::Stages => "p.num_stages",
        PlaybookSortField::Steps => "p.num_steps",
    };

    Ok(CompiledQuery {
        from: "playbooks p",
        columns: PLAYBOOK_COLUMNS,
        where_sql: clause.sql(),
        params: clause.params(),
        order_by: order_by(column, direction.as_sql(), "p.id"),
        paging: options.paging(),
    })
}

fn search_predicate(column: &str, term: &str) -> Predicate {
    Predicate::new(
        format!("instr({NORMALIZE_FN}({column}), ?) > 0"),
        vec![Value::Text(search::normalize(term))],
    )
}

fn order_by(column: &str, direction: &str, id_column: &str) -> String {
    if column == id_column {
        format!("{column} {direction}")
    } else {
        format!("{column} {direction}, {id_column} ASC")
    }
}
