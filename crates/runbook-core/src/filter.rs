use serde::{Deserialize, Serialize};

use crate::model::RunStatus;
use crate::RunbookError;

/// Identity and role of the user a query is evaluated for.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct RequesterInfo {
    pub user_id: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_guest: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RequesterRole {
    Admin,
    Guest,
    Member,
}

impl RequesterInfo {
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: false,
            is_guest: false,
        }
    }

    #[must_use]
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            is_admin: true,
            ..Self::new(user_id)
        }
    }

    #[must_use]
    pub fn guest(user_id: impl Into<String>) -> Self {
        Self {
            is_guest: true,
            ..Self::new(user_id)
        }
    }

    /// Admin wins over guest when both flags are set.
    #[must_use]
    pub fn role(&self) -> RequesterRole {
        if self.is_admin {
            RequesterRole::Admin
        } else if self.is_guest {
            RequesterRole::Guest
        } else {
            RequesterRole::Member
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// Empty input selects the ascending default.
    ///
    /// # Errors
    /// Returns [`RunbookError::UnsupportedDirection`] for anything other than
    /// `asc` or `desc` (case-insensitive).
    pub fn parse(value: &str) -> Result<Self, RunbookError> {
        match value.to_ascii_lowercase().as_str() {
            "" | "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            _ => Err(RunbookError::UnsupportedDirection(value.to_string())),
        }
    }

    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum SortField {
    CreateAt,
    #[default]
    Id,
    Name,
    OwnerUserId,
    TeamId,
    EndAt,
    Status,
    LastStatusUpdateAt,
}

impl SortField {
    /// Empty input selects `id`, the stable default key. Matching ignores
    /// case and underscores, so `create_at` and `CreateAt` are the same key.
    ///
    /// # Errors
    /// Returns [`RunbookError::UnsupportedSortField`] for unknown field names.
    pub fn parse(value: &str) -> Result<Self, RunbookError> {
        match value.to_ascii_lowercase().replace('_', "").as_str() {
            "" | "id" => Ok(Self::Id),
            "createat" => Ok(Self::CreateAt),
            "name" => Ok(Self::Name),
            "owneruserid" => Ok(Self::OwnerUserId),
            "teamid" => Ok(Self::TeamId),
            "endat" => Ok(Self::EndAt),
            "status" => Ok(Self::Status),
            "laststatusupdateat" => Ok(Self::LastStatusUpdateAt),
            _ => Err(RunbookError::UnsupportedSortField(value.to_string())),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateAt => "create_at",
            Self::Id => "id",
            Self::Name => "name",
            Self::OwnerUserId => "owner_user_id",
            Self::TeamId => "team_id",
            Self::EndAt => "end_at",
            Self::Status => "status",
            Self::LastStatusUpdateAt => "last_status_update_at",
        }
    }
}

/// Caller-supplied run query. String-typed sort and direction so that
/// unsupported values are reported rather than unrepresentable.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(default)]
pub struct FilterOptions {
    pub team_id: String,
    pub status: Option<RunStatus>,
    pub statuses: Vec<RunStatus>,
    pub owner_id: String,
    pub participant_id: String,
    pub member_id: String,
    pub playbook_id: String,
    pub search_term: String,
    pub sort: String,
    pub direction: String,
    pub page: i64,
    pub per_page: i64,
    pub active_gte: i64,
    pub active_lt: i64,
    pub started_gte: i64,
    pub started_lt: i64,
}

impl FilterOptions {
    #[must_use]
    pub fn for_team(team_id: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            ..Self::default()
        }
    }

    /// # Errors
    /// Returns [`RunbookError::UnsupportedSortField`] for an unknown sort key.
    pub fn sort_field(&self) -> Result<SortField, RunbookError> {
        SortField::parse(&self.sort)
    }

    /// # Errors
    /// Returns [`RunbookError::UnsupportedDirection`] for an unknown direction.
    pub fn sort_direction(&self) -> Result<SortDirection, RunbookError> {
        SortDirection::parse(&self.direction)
    }

    /// Folds `status` and `statuses` into one set.
    ///
    /// # Errors
    /// Returns [`RunbookError::InvalidArgument`] when both are supplied.
    pub fn status_set(&self) -> Result<Vec<RunStatus>, RunbookError> {
        match (self.status, self.statuses.is_empty()) {
            (Some(_), false) => Err(RunbookError::InvalidArgument(
                "cannot use both status and statuses filters".to_string(),
            )),
            (Some(status), true) => Ok(vec![status]),
            (None, _) => Ok(self.statuses.clone()),
        }
    }

    #[must_use]
    pub fn paging(&self) -> Paging {
        Paging::new(self.page, self.per_page)
    }
}

/// Playbook sort keys.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum PlaybookSortField {
    #[default]
    Id,
    Title,
    Stages,
    Steps,
}

impl PlaybookSortField {
    /// # Errors
    /// Returns [`RunbookError::UnsupportedSortField`] for unknown field names.
    pub fn parse(value: &str) -> Result<Self, RunbookError> {
        match value.to_ascii_lowercase().as_str() {
            "" | "id" => Ok(Self::Id),
            "title" => Ok(Self::Title),
            "stages" => Ok(Self::Stages),
            "steps" => Ok(Self::Steps),
            _ => Err(RunbookError::UnsupportedSortField(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(default)]
pub struct PlaybookFilterOptions {
    pub sort: String,
    pub direction: String,
    pub search_term: String,
    pub page: i64,
    pub per_page: i64,
}

impl PlaybookFilterOptions {
    #[must_use]
    pub fn paging(&self) -> Paging {
        Paging::new(self.page, self.per_page)
    }
}

/// Page window with negative inputs clamped to zero.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct Paging {
    pub page: i64,
    pub per_page: i64,
}

impl Paging {
    #[must_use]
    pub fn new(page: i64, per_page: i64) -> Self {
        Self {
            page: page.max(0),
            per_page: per_page.max(0),
        }
    }

    #[must_use]
    pub fn offset(self) -> i64 {
        self.page.saturating_mul(self.per_page)
    }

    #[must_use]
    pub fn page_count(self, total_count: i64) -> i64 {
        if self.per_page == 0 {
            return 0;
        }
        (total_count + self.per_page - 1) / self.per_page
    }

    #[must_use]
    pub fn has_more(self, total_count: i64) -> bool {
        self.per_page > 0 && (self.page + 1).saturating_mul(self.per_page) < total_count
    }

    #[must_use]
    pub fn results<T>(self, items: Vec<T>, total_count: i64) -> ListResults<T> {
        ListResults {
            total_count,
            page_count: self.page_count(total_count),
            has_more: self.has_more(total_count),
            items,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ListResults<T> {
    pub total_count: i64,
    pub page_count: i64,
    pub has_more: bool,
    pub items: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_and_direction_parse_case_insensitively() {
        assert_eq!(SortField::parse("NAME"), Ok(SortField::Name));
        assert_eq!(SortField::parse(""), Ok(SortField::Id));
        assert_eq!(SortField::parse("CreateAt"), Ok(SortField::CreateAt));
        assert_eq!(SortField::parse("owner_user_id"), Ok(SortField::OwnerUserId));
        assert_eq!(SortField::parse("OwnerUserID"), Ok(SortField::OwnerUserId));
        assert_eq!(SortDirection::parse("Desc"), Ok(SortDirection::Desc));
        assert_eq!(SortDirection::parse(""), Ok(SortDirection::Asc));
    }

    #[test]
    fn unknown_sort_values_name_the_bad_input() {
        assert_eq!(
            SortField::parse("unknown_field"),
            Err(RunbookError::UnsupportedSortField(
                "unknown_field".to_string()
            ))
        );
        assert_eq!(
            SortDirection::parse("sideways"),
            Err(RunbookError::UnsupportedDirection("sideways".to_string()))
        );
    }

    #[test]
    fn status_and_statuses_are_mutually_exclusive() {
        let options = FilterOptions {
            status: Some(RunStatus::Reported),
            statuses: vec![RunStatus::Finished],
            ..FilterOptions::default()
        };
        assert!(matches!(
            options.status_set(),
            Err(RunbookError::InvalidArgument(_))
        ));
    }

    #[test]
    fn paging_clamps_and_counts() {
        let paging = Paging::new(-3, -1);
        assert_eq!(paging, Paging::new(0, 0));
        assert_eq!(paging.page_count(10), 0);
        assert!(!paging.has_more(10));

        let paging = Paging::new(1, 4);
        assert_eq!(paging.offset(), 4);
        assert_eq!(paging.page_count(10), 3);
        assert!(paging.has_more(10));
        assert!(!Paging::new(2, 4).has_more(10));
        assert_eq!(Paging::new(0, 5).page_count(10), 2);
    }

    #[test]
    fn requester_role_prefers_admin() {
        let mut requester = RequesterInfo::guest("u1");
        assert_eq!(requester.role(), RequesterRole::Guest);
        requester.is_admin = true;
        assert_eq!(requester.role(), RequesterRole::Admin);
        assert_eq!(RequesterInfo::new("u2").role(), RequesterRole::Member);
    }
}
