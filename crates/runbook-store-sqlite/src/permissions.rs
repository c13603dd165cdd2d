//! Visibility predicates, one per requester role.
//!
//! Every list and count query ANDs these into its `WHERE` clause so that
//! paging and totals are computed over visible rows only. Run predicates
//! assume the runs table is aliased `r`; playbook predicates assume `p`.

use rusqlite::types::Value;
use runbook_core::{RequesterInfo, RequesterRole};

use crate::query::Predicate;

const CHANNEL_MEMBER: &str = "EXISTS (SELECT 1 FROM channel_members cm
    WHERE cm.channel_id = r.channel_id AND cm.user_id = ?)";

const PLAYBOOK_OPEN_OR_MEMBER: &str = "EXISTS (SELECT 1 FROM playbooks pb
    WHERE pb.id = r.playbook_id
      AND (NOT EXISTS (SELECT 1 FROM playbook_members pm WHERE pm.playbook_id = pb.id)
           OR EXISTS (SELECT 1 FROM playbook_members pm
                      WHERE pm.playbook_id = pb.id AND pm.member_id = ?)))";

/// `None` for admins; they are limited only by [`team_limit`].
pub(crate) fn run_visibility(requester: &RequesterInfo) -> Option<Predicate> {
    let user = Value::Text(requester.user_id.to_lowercase());
    match requester.role() {
        RequesterRole::Admin => None,
        RequesterRole::Guest => Some(Predicate::new(CHANNEL_MEMBER, vec![user])),
        RequesterRole::Member => Some(Predicate::new(
            format!("{CHANNEL_MEMBER} OR {PLAYBOOK_OPEN_OR_MEMBER}"),
            vec![user.clone(), user],
        )),
    }
}

/// Exact team match when `team_id` is given, otherwise the requester must
/// be an active member of the row's team. `column` names the row's team
/// column, e.g. `r.team_id`.
pub(crate) fn team_limit(requester: &RequesterInfo, team_id: &str, column: &str) -> Predicate {
    if team_id.is_empty() {
        Predicate::new(
            format!(
                "EXISTS (SELECT 1 FROM team_members tm
                    WHERE tm.team_id = {column} AND tm.delete_at = 0 AND tm.user_id = ?)"
            ),
            vec![Value::Text(requester.user_id.to_lowercase())],
        )
    } else {
        Predicate::new(format!("{column} = ?"), vec![Value::Text(team_id.to_string())])
    }
}

/// Admins see every playbook. Members see playbooks without a member list or
/// that list them; guests must be listed explicitly.
pub(crate) fn playbook_visibility(requester: &RequesterInfo) -> Option<Predicate> {
    let user = Value::Text(requester.user_id.to_lowercase());
    let listed = "EXISTS (SELECT 1 FROM playbook_members pm
        WHERE pm.playbook_id = p.id AND pm.member_id = ?)";
    match requester.role() {
        RequesterRole::Admin => None,
        RequesterRole::Guest => Some(Predicate::new(listed, vec![user])),
        RequesterRole::Member => Some(Predicate::new(
            format!(
                "NOT EXISTS (SELECT 1 FROM playbook_members pm WHERE pm.playbook_id = p.id)
                 OR {listed}"
            ),
            vec![user],
        )),
    }
}
