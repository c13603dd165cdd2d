//! Two-way mapping between ordered checklists and flat, position-tagged rows.
//!
//! A run's checklists are stored either as rows keyed by `(parent, position)`
//! or as one JSON array blob. Both decode to the same ordering. Positions must
//! be dense (`0..n`) within each parent; a gap or a repeated position is a
//! data-integrity fault and is reported, never compacted.

use std::collections::BTreeMap;

use crate::model::{Checklist, ChecklistItem};
use crate::RunbookError;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChecklistRow {
    pub id: String,
    pub parent_id: String,
    pub title: String,
    pub position: i64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ItemRow {
    pub parent_id: String,
    pub position: i64,
    pub item: ChecklistItem,
}

#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct EncodedChecklists {
    pub checklists: Vec<ChecklistRow>,
    pub items: Vec<ItemRow>,
}

/// Flattens `checklists` owned by `parent_id` into rows.
///
/// # Errors
/// Returns [`RunbookError::MalformedPositionData`] when a checklist has no ID,
/// since its items could not reference it.
pub fn encode(parent_id: &str, checklists: &[Checklist]) -> Result<EncodedChecklists, RunbookError> {
    let mut encoded = EncodedChecklists::default();
    for (checklist_position, checklist) in checklists.iter().enumerate() {
        if checklist.id.is_empty() {
            return Err(RunbookError::MalformedPositionData(format!(
                "checklist at position {checklist_position} of '{parent_id}' has no id"
            )));
        }
        encoded.checklists.push(ChecklistRow {
            id: checklist.id.clone(),
            parent_id: parent_id.to_string(),
            title: checklist.title.clone(),
            position: to_position(checklist_position),
        });
        for (item_position, item) in checklist.items.iter().enumerate() {
            encoded.items.push(ItemRow {
                parent_id: checklist.id.clone(),
                position: to_position(item_position),
                item: item.clone(),
            });
        }
    }
    Ok(encoded)
}

/// Rebuilds ordered checklists per parent. Row order is irrelevant.
///
/// # Errors
/// Returns [`RunbookError::MalformedPositionData`] when positions within a
/// parent are not exactly `0..n`, or when an item references a checklist that
/// is not among `checklists`.
pub fn decode(
    checklists: Vec<ChecklistRow>,
    items: Vec<ItemRow>,
) -> Result<BTreeMap<String, Vec<Checklist>>, RunbookError> {
    let mut items_by_checklist: BTreeMap<String, Vec<(i64, ChecklistItem)>> = BTreeMap::new();
    for row in items {
        items_by_checklist
            .entry(row.parent_id)
            .or_default()
            .push((row.position, row.item));
    }

    let mut checklists_by_parent: BTreeMap<String, Vec<(i64, Checklist)>> = BTreeMap::new();
    for row in checklists {
        let item_rows = items_by_checklist.remove(&row.id).unwrap_or_default();
        let checklist = Checklist {
            items: place(&row.id, item_rows)?,
            id: row.id,
            title: row.title,
        };
        checklists_by_parent
            .entry(row.parent_id)
            .or_default()
            .push((row.position, checklist));
    }

    if let Some(orphan) = items_by_checklist.keys().next() {
        return Err(RunbookError::MalformedPositionData(format!(
            "checklist items reference missing checklist '{orphan}'"
        )));
    }

    checklists_by_parent
        .into_iter()
        .map(|(parent_id, rows)| {
            let ordered = place(&parent_id, rows)?;
            Ok((parent_id, ordered))
        })
        .collect()
}

/// Serializes checklists into the single-blob form; array order is position.
///
/// # Errors
/// Returns [`RunbookError::MalformedPositionData`] if serialization fails.
pub fn to_blob(checklists: &[Checklist]) -> Result<String, RunbookError> {
    serde_json::to_string(checklists)
        .map_err(|err| RunbookError::MalformedPositionData(format!("checklist blob: {err}")))
}

/// # Errors
/// Returns [`RunbookError::MalformedPositionData`] if `blob` is not a JSON
/// array of checklists.
pub fn from_blob(blob: &str) -> Result<Vec<Checklist>, RunbookError> {
    if blob.trim().is_empty() || blob.trim() == "null" {
        return Ok(Vec::new());
    }
    serde_json::from_str(blob)
        .map_err(|err| RunbookError::MalformedPositionData(format!("checklist blob: {err}")))
}

fn place<T>(parent_id: &str, rows: Vec<(i64, T)>) -> Result<Vec<T>, RunbookError> {
    let len = rows.len();
    let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(len).collect();
    for (position, value) in rows {
        let index = usize::try_from(position)
            .ok()
            .filter(|index| *index < len)
            .ok_or_else(|| {
                RunbookError::MalformedPositionData(format!(
                    "position {position} outside 0..{len} under '{parent_id}'"
                ))
            })?;
        if slots[index].replace(value).is_some() {
            return Err(RunbookError::MalformedPositionData(format!(
                "duplicate position {position} under '{parent_id}'"
            )));
        }
    }
    slots.into_iter().collect::<Option<Vec<T>>>().ok_or_else(|| {
        RunbookError::MalformedPositionData(format!("position gap under '{parent_id}'"))
    })
}

fn to_position(index: usize) -> i64 {
    i64::try_from(index).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checklist::populate_ids;
    use proptest::prelude::*;

    fn must<T>(result: Result<T, RunbookError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_checklists() -> Vec<Checklist> {
        let mut checklists = vec![
            Checklist::new(
                "triage",
                vec![ChecklistItem::new("page oncall"), ChecklistItem::new("open bridge")],
            ),
            Checklist::new("empty", Vec::new()),
            Checklist::new("resolve", vec![ChecklistItem::new("write summary")]),
        ];
        populate_ids(&mut checklists);
        checklists
    }

    #[test]
    fn rows_decode_regardless_of_arrival_order() {
        let checklists = fixture_checklists();
        let mut encoded = must(encode("run-1", &checklists));
        encoded.checklists.reverse();
        encoded.items.reverse();

        let mut decoded = must(decode(encoded.checklists, encoded.items));
        assert_eq!(decoded.remove("run-1"), Some(checklists));
        assert!(decoded.is_empty());
    }

    #[test]
    fn blob_and_rows_agree_on_order() {
        let checklists = fixture_checklists();
        let blob = must(to_blob(&checklists));
        let from_blob = must(from_blob(&blob));
        let encoded = must(encode("run-1", &checklists));
        let from_rows = must(decode(encoded.checklists, encoded.items));
        assert_eq!(from_rows.get("run-1"), Some(&from_blob));
    }

    #[test]
    fn gap_is_reported_not_compacted() {
        let checklists = fixture_checklists();
        let mut encoded = must(encode("run-1", &checklists));
        for row in &mut encoded.items {
            if row.position == 1 {
                row.position = 2;
            }
        }
        assert!(matches!(
            decode(encoded.checklists, encoded.items),
            Err(RunbookError::MalformedPositionData(_))
        ));
    }

    #[test]
    fn duplicate_position_is_reported() {
        let checklists = fixture_checklists();
        let mut encoded = must(encode("run-1", &checklists));
        for row in &mut encoded.checklists {
            row.position = 0;
        }
        assert!(matches!(
            decode(encoded.checklists, encoded.items),
            Err(RunbookError::MalformedPositionData(_))
        ));
    }

    #[test]
    fn orphan_items_are_reported() {
        let checklists = fixture_checklists();
        let encoded = must(encode("run-1", &checklists));
        assert!(matches!(
            decode(Vec::new(), encoded.items),
            Err(RunbookError::MalformedPositionData(_))
        ));
    }

    #[test]
    fn encode_requires_checklist_ids() {
        let checklists = vec![Checklist::new("no id", Vec::new())];
        assert!(matches!(
            encode("run-1", &checklists),
            Err(RunbookError::MalformedPositionData(_))
        ));
    }

    #[test]
    fn malformed_blob_is_reported() {
        assert!(matches!(
            from_blob("{\"title\": 1}"),
            Err(RunbookError::MalformedPositionData(_))
        ));
        assert_eq!(must(from_blob("null")), Vec::new());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn encode_then_decode_preserves_structure(
            shape in proptest::collection::vec(
                ("[a-z ]{1,12}", proptest::collection::vec("[a-z ]{1,12}", 0..6)),
                1..6,
            )
        ) {
            let mut checklists: Vec<Checklist> = shape
                .into_iter()
                .map(|(title, items)| {
                    Checklist::new(title, items.into_iter().map(ChecklistItem::new).collect())
                })
                .collect();
            populate_ids(&mut checklists);

            let encoded = encode("run-p", &checklists);
            prop_assert!(encoded.is_ok());
            let encoded = encoded.unwrap_or_default();
            let decoded = decode(encoded.checklists, encoded.items);
            prop_assert!(decoded.is_ok());
            let decoded = decoded.unwrap_or_default();
            prop_assert_eq!(decoded.get("run-p"), Some(&checklists));
        }
    }
}
