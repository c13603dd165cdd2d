use crate::model::{Checklist, ChecklistItem, ChecklistItemState};
use crate::{new_id, RunbookError};

/// Assigns a fresh ID to every checklist and item that lacks one.
pub fn populate_ids(checklists: &mut [Checklist]) {
    for checklist in checklists {
        if checklist.id.is_empty() {
            checklist.id = new_id();
        }
        for item in &mut checklist.items {
            if item.id.is_empty() {
                item.id = new_id();
            }
        }
    }
}

/// Replaces every checklist and item ID with a fresh one. Titles, order and
/// item progress are kept.
pub fn reassign_ids(checklists: &mut [Checklist]) {
    for checklist in checklists {
        checklist.id = new_id();
        for item in &mut checklist.items {
            item.id = new_id();
        }
    }
}

/// Clones template checklists for a new run: every ID is fresh and all
/// per-run progress is cleared.
#[must_use]
pub fn instantiate(template: &[Checklist]) -> Vec<Checklist> {
    template
        .iter()
        .map(|checklist| Checklist {
            id: new_id(),
            title: checklist.title.clone(),
            items: checklist
                .items
                .iter()
                .map(|item| ChecklistItem {
                    id: new_id(),
                    title: item.title.clone(),
                    state: ChecklistItemState::Open,
                    command: item.command.clone(),
                    description: item.description.clone(),
                    due_date: item.due_date,
                    ..ChecklistItem::default()
                })
                .collect(),
        })
        .collect()
}

/// # Errors
/// Returns [`RunbookError::InvalidArgument`] when either index is out of range.
pub fn item(
    checklists: &[Checklist],
    checklist_num: usize,
    item_num: usize,
) -> Result<&ChecklistItem, RunbookError> {
    checklists
        .get(checklist_num)
        .ok_or_else(|| out_of_range("checklist", checklist_num))?
        .items
        .get(item_num)
        .ok_or_else(|| out_of_range("item", item_num))
}

/// # Errors
/// Returns [`RunbookError::InvalidArgument`] when either index is out of range.
pub fn item_mut(
    checklists: &mut [Checklist],
    checklist_num: usize,
    item_num: usize,
) -> Result<&mut ChecklistItem, RunbookError> {
    checklists
        .get_mut(checklist_num)
        .ok_or_else(|| out_of_range("checklist", checklist_num))?
        .items
        .get_mut(item_num)
        .ok_or_else(|| out_of_range("item", item_num))
}

/// Moves a whole checklist. The list is left unchanged on error.
///
/// # Errors
/// Returns [`RunbookError::InvalidArgument`] when either index is out of range.
pub fn move_checklist(
    checklists: &mut Vec<Checklist>,
    source: usize,
    destination: usize,
) -> Result<(), RunbookError> {
    if source >= checklists.len() {
        return Err(out_of_range("source checklist", source));
    }
    if destination >= checklists.len() {
        return Err(out_of_range("destination checklist", destination));
    }
    let moved = checklists.remove(source);
    checklists.insert(destination, moved);
    Ok(())
}

/// Moves one item, possibly across checklists. The destination index is
/// interpreted after removal, so within one checklist it may be at most
/// `len - 1`, and across checklists at most the destination's `len`.
///
/// # Errors
/// Returns [`RunbookError::InvalidArgument`] when any index is out of range.
pub fn move_item(
    checklists: &mut [Checklist],
    source_checklist: usize,
    source_item: usize,
    destination_checklist: usize,
    destination_item: usize,
) -> Result<(), RunbookError> {
    let source_len = checklists
        .get(source_checklist)
        .ok_or_else(|| out_of_range("source checklist", source_checklist))?
        .items
        .len();
    if source_item >= source_len {
        return Err(out_of_range("source item", source_item));
    }
    let destination_len = checklists
        .get(destination_checklist)
        .ok_or_else(|| out_of_range("destination checklist", destination_checklist))?
        .items
        .len();
    let max_destination = if source_checklist == destination_checklist {
        destination_len - 1
    } else {
        destination_len
    };
    if destination_item > max_destination {
        return Err(out_of_range("destination item", destination_item));
    }

    let moved = checklists[source_checklist].items.remove(source_item);
    checklists[destination_checklist]
        .items
        .insert(destination_item, moved);
    Ok(())
}

fn out_of_range(what: &str, index: usize) -> RunbookError {
    RunbookError::InvalidArgument(format!("{what} index {index} out of range"))
}
