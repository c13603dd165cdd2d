use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default,
)]
pub enum RunStatus {
    #[default]
    Reported,
    InProgress,
    Finished,
    Archived,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reported => "Reported",
            Self::InProgress => "InProgress",
            Self::Finished => "Finished",
            Self::Archived => "Archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Reported" => Some(Self::Reported),
            "InProgress" => Some(Self::InProgress),
            "Finished" => Some(Self::Finished),
            "Archived" => Some(Self::Archived),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Archived)
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistItemState {
    #[default]
    #[serde(rename = "")]
    Open,
    InProgress,
    Closed,
    Skipped,
}

impl ChecklistItemState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "",
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "closed" => Some(Self::Closed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ChecklistItem {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub state: ChecklistItemState,
    #[serde(default)]
    pub state_modified: i64,
    #[serde(default)]
    pub assignee_id: String,
    #[serde(default)]
    pub assignee_modified: i64,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub command_last_run: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub due_date: i64,
}

impl ChecklistItem {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct Checklist {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub items: Vec<ChecklistItem>,
}

impl Checklist {
    #[must_use]
    pub fn new(title: impl Into<String>, items: Vec<ChecklistItem>) -> Self {
        Self {
            id: String::new(),
            title: title.into(),
            items,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatusPost {
    pub id: String,
    pub status: RunStatus,
    pub create_at: i64,
    #[serde(default)]
    pub delete_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    IncidentCreated,
    TaskStateModified,
    StatusUpdated,
    OwnerChanged,
    AssigneeChanged,
    RanSlashCommand,
    EventFromPost,
    UserJoinedLeft,
    PublishedRetrospective,
    CanceledRetrospective,
}

impl TimelineEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IncidentCreated => "incident_created",
            Self::TaskStateModified => "task_state_modified",
            Self::StatusUpdated => "status_updated",
            Self::OwnerChanged => "owner_changed",
            Self::AssigneeChanged => "assignee_changed",
            Self::RanSlashCommand => "ran_slash_command",
            Self::EventFromPost => "event_from_post",
            Self::UserJoinedLeft => "user_joined_left",
            Self::PublishedRetrospective => "published_retrospective",
            Self::CanceledRetrospective => "canceled_retrospective",
        }
    }

    /// Parses a stored event type. `commander_changed` is the pre-rename
    /// spelling of `owner_changed`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "incident_created" => Some(Self::IncidentCreated),
            "task_state_modified" => Some(Self::TaskStateModified),
            "status_updated" => Some(Self::StatusUpdated),
            "owner_changed" | "commander_changed" => Some(Self::OwnerChanged),
            "assignee_changed" => Some(Self::AssigneeChanged),
            "ran_slash_command" => Some(Self::RanSlashCommand),
            "event_from_post" => Some(Self::EventFromPost),
            "user_joined_left" => Some(Self::UserJoinedLeft),
            "published_retrospective" => Some(Self::PublishedRetrospective),
            "canceled_retrospective" => Some(Self::CanceledRetrospective),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TimelineEvent {
    pub id: String,
    pub run_id: String,
    pub create_at: i64,
    #[serde(default)]
    pub delete_at: i64,
    pub event_at: i64,
    pub event_type: TimelineEventType,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub post_id: String,
    #[serde(default)]
    pub subject_user_id: String,
    #[serde(default)]
    pub creator_user_id: String,
}

/// An instantiated playbook execution. Owns exactly one channel.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct Run {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub owner_user_id: String,
    #[serde(default)]
    pub reporter_user_id: String,
    pub team_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub create_at: i64,
    #[serde(default)]
    pub end_at: i64,
    #[serde(default)]
    pub delete_at: i64,
    #[serde(default)]
    pub current_status: RunStatus,
    #[serde(default)]
    pub last_status_update_at: i64,
    #[serde(default)]
    pub playbook_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub checklists: Vec<Checklist>,
    /// Live channel membership minus bot accounts; never persisted.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub participant_ids: Vec<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub status_posts: Vec<StatusPost>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub timeline_events: Vec<TimelineEvent>,
}

impl Run {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.end_at == 0
    }

    /// Instantiates a run from a playbook template. Checklists are cloned
    /// with fresh IDs and their item state reset.
    #[must_use]
    pub fn from_playbook(
        playbook: &Playbook,
        name: impl Into<String>,
        owner_user_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        let owner_user_id = owner_user_id.into();
        Self {
            name: name.into(),
            reporter_user_id: owner_user_id.clone(),
            owner_user_id,
            team_id: playbook.team_id.clone(),
            channel_id: channel_id.into(),
            playbook_id: playbook.id.clone(),
            checklists: crate::checklist::instantiate(&playbook.checklists),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct Playbook {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub team_id: String,
    #[serde(default)]
    pub create_public_run: bool,
    #[serde(default)]
    pub create_at: i64,
    #[serde(default)]
    pub delete_at: i64,
    #[serde(default)]
    pub num_stages: i64,
    #[serde(default)]
    pub num_steps: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub checklists: Vec<Checklist>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub member_ids: Vec<String>,
    #[serde(default)]
    pub broadcast_channel_id: String,
    #[serde(default)]
    pub broadcast_enabled: bool,
    #[serde(default)]
    pub webhook_on_creation_url: String,
    #[serde(default)]
    pub webhook_on_status_update_url: String,
}

impl Playbook {
    /// Recomputes `num_stages` and `num_steps` from the checklists.
    pub fn refresh_counts(&mut self) {
        self.num_stages = i64::try_from(self.checklists.len()).unwrap_or(i64::MAX);
        self.num_steps = self
            .checklists
            .iter()
            .map(|checklist| i64::try_from(checklist.items.len()).unwrap_or(i64::MAX))
            .sum();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CategoryItemType {
    Playbook,
    Run,
}

impl CategoryItemType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Playbook => "playbook",
            Self::Run => "run",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "playbook" | "p" => Some(Self::Playbook),
            "run" | "r" => Some(Self::Run),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CategoryItem {
    pub item_id: String,
    pub item_type: CategoryItemType,
}

/// A team- and user-scoped folder of playbooks and runs.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct Category {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub team_id: String,
    pub user_id: String,
    #[serde(default)]
    pub collapsed: bool,
    #[serde(default)]
    pub create_at: i64,
    #[serde(default)]
    pub update_at: i64,
    #[serde(default)]
    pub delete_at: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub items: Vec<CategoryItem>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_commander_event_reads_as_owner_change() {
        assert_eq!(
            TimelineEventType::parse("commander_changed"),
            Some(TimelineEventType::OwnerChanged)
        );
        assert_eq!(TimelineEventType::OwnerChanged.as_str(), "owner_changed");
    }

    #[test]
    fn open_state_serializes_as_empty_string() {
        let item = ChecklistItem::new("check dashboards");
        let encoded = match serde_json::to_value(&item) {
            Ok(value) => value,
            Err(err) => panic!("serialize failed: {err}"),
        };
        assert_eq!(encoded["state"], serde_json::json!(""));
        assert_eq!(ChecklistItemState::parse("skipped"), Some(ChecklistItemState::Skipped));
    }

    #[test]
    fn null_collections_decode_as_empty() {
        let run: Run = match serde_json::from_str(
            r#"{"name": "db outage", "team_id": "t1", "channel_id": "c1", "checklists": null}"#,
        ) {
            Ok(value) => value,
            Err(err) => panic!("deserialize failed: {err}"),
        };
        assert!(run.checklists.is_empty());
        assert_eq!(run.current_status, RunStatus::Reported);
        assert!(run.is_active());
    }

    #[test]
    fn run_from_playbook_clones_template() {
        let mut playbook = Playbook {
            id: "pb1".to_string(),
            title: "Outage".to_string(),
            team_id: "t1".to_string(),
            checklists: vec![Checklist::new(
                "triage",
                vec![ChecklistItem::new("page"), ChecklistItem::new("assess")],
            )],
            ..Playbook::default()
        };
        crate::checklist::populate_ids(&mut playbook.checklists);
        playbook.refresh_counts();
        assert_eq!((playbook.num_stages, playbook.num_steps), (1, 2));

        let run = Run::from_playbook(&playbook, "db outage", "owner", "chan");
        assert_eq!(run.playbook_id, "pb1");
        assert_eq!(run.team_id, "t1");
        assert_eq!(run.reporter_user_id, "owner");
        assert_eq!(run.checklists[0].items.len(), 2);
        assert_ne!(run.checklists[0].id, playbook.checklists[0].id);
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            RunStatus::Reported,
            RunStatus::InProgress,
            RunStatus::Finished,
            RunStatus::Archived,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert!(RunStatus::Finished.is_terminal());
        assert_eq!(RunStatus::parse("Active"), None);
    }
}
