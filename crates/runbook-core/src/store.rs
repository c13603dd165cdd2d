use anyhow::Result;

use crate::condition::{Condition, ConditionFilterOptions};
use crate::filter::{FilterOptions, ListResults, PlaybookFilterOptions, RequesterInfo};
use crate::model::{
    Category, CategoryItem, ChecklistItem, ChecklistItemState, Playbook, Run, StatusPost,
    TimelineEvent,
};

/// Persistence for runs and everything hanging off them.
///
/// Errors carry a [`crate::RunbookError`] sentinel somewhere in their chain
/// when the failure is one a caller can act on; see [`crate::classify`].
pub trait RunStore {
    /// Stores a new run, assigning IDs to the run and to any checklist or
    /// item lacking one. Returns the stored run.
    fn create_run(&self, run: &Run) -> Result<Run>;
    /// Replaces mutable fields and checklists. `name` and `create_at` are
    /// never changed.
    fn update_run(&self, run: &Run) -> Result<()>;
    fn get_run(&self, id: &str) -> Result<Run>;
    fn list_runs(
        &self,
        requester: &RequesterInfo,
        options: &FilterOptions,
    ) -> Result<ListResults<Run>>;
    fn get_run_id_for_channel(&self, channel_id: &str) -> Result<String>;
    fn get_owners(&self, requester: &RequesterInfo, options: &FilterOptions)
        -> Result<Vec<String>>;

    fn follow(&self, run_id: &str, user_id: &str) -> Result<()>;
    fn unfollow(&self, run_id: &str, user_id: &str) -> Result<()>;
    fn get_followers(&self, run_id: &str) -> Result<Vec<String>>;

    fn update_status(&self, run_id: &str, post: &StatusPost) -> Result<()>;
    fn create_timeline_event(&self, event: &TimelineEvent) -> Result<TimelineEvent>;
    fn update_timeline_event(&self, event: &TimelineEvent) -> Result<()>;
    fn get_timeline_event(&self, run_id: &str, event_id: &str) -> Result<TimelineEvent>;

    fn get_checklist_item(
        &self,
        run_id: &str,
        checklist_num: usize,
        item_num: usize,
    ) -> Result<ChecklistItem>;
    fn set_checklist_item_state(
        &self,
        run_id: &str,
        checklist_num: usize,
        item_num: usize,
        state: ChecklistItemState,
    ) -> Result<()>;
    fn set_checklist_item_assignee(
        &self,
        run_id: &str,
        checklist_num: usize,
        item_num: usize,
        assignee_id: &str,
    ) -> Result<()>;
    fn move_checklist(&self, run_id: &str, source: usize, destination: usize) -> Result<()>;
    fn move_checklist_item(
        &self,
        run_id: &str,
        source_checklist: usize,
        source_item: usize,
        destination_checklist: usize,
        destination_item: usize,
    ) -> Result<()>;

    /// Fails with `DuplicateEntry` when the view is already recorded.
    fn set_viewed_channel(&self, user_id: &str, channel_id: &str) -> Result<()>;
    fn has_viewed_channel(&self, user_id: &str, channel_id: &str) -> Result<bool>;
}

pub trait PlaybookStore {
    fn create_playbook(&self, playbook: &Playbook) -> Result<Playbook>;
    fn get_playbook(&self, id: &str) -> Result<Playbook>;
    fn get_playbooks(&self) -> Result<Vec<Playbook>>;
    fn get_playbooks_for_team(
        &self,
        requester: &RequesterInfo,
        team_id: &str,
        options: &PlaybookFilterOptions,
    ) -> Result<ListResults<Playbook>>;
    fn update_playbook(&self, playbook: &Playbook) -> Result<()>;
    fn archive_playbook(&self, id: &str) -> Result<()>;
}

pub trait CategoryStore {
    fn create_category(&self, category: &Category) -> Result<Category>;
    fn get_category(&self, id: &str) -> Result<Category>;
    fn get_categories(&self, team_id: &str, user_id: &str) -> Result<Vec<Category>>;
    fn update_category(&self, category: &Category) -> Result<()>;
    fn delete_category(&self, id: &str) -> Result<()>;
    fn add_category_item(&self, category_id: &str, item: &CategoryItem) -> Result<()>;
    fn remove_category_item(&self, category_id: &str, item: &CategoryItem) -> Result<()>;
}

pub trait ConditionStore {
    fn create_condition(&self, playbook_id: &str, condition: &Condition) -> Result<Condition>;
    fn get_condition(&self, playbook_id: &str, id: &str) -> Result<Condition>;
    fn update_condition(&self, playbook_id: &str, condition: &Condition) -> Result<Condition>;
    fn delete_condition(&self, playbook_id: &str, id: &str) -> Result<()>;
    fn get_conditions(
        &self,
        playbook_id: &str,
        options: &ConditionFilterOptions,
    ) -> Result<Vec<Condition>>;
    fn count_conditions_for_run(&self, playbook_id: &str, run_id: &str) -> Result<i64>;
}
