//! Multi-select state and bulk actions over it.

use super::events::MutationKind;
use crate::remote::{DocumentId, DocumentRecord};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Ordered set of selected document ids for one displayed collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionSet {
    ids: BTreeSet<DocumentId>,
}

impl SelectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `id` was already selected.
    pub fn select(&mut self, id: DocumentId) -> bool {
        self.ids.insert(id)
    }

    pub fn deselect(&mut self, id: &DocumentId) -> bool {
        self.ids.remove(id)
    }

    /// Flip membership of `id`; returns whether it is selected afterwards.
    pub fn toggle(&mut self, id: DocumentId) -> bool {
        if self.ids.remove(&id) {
            false
        } else {
            self.ids.insert(id);
            true
        }
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.ids.contains(id)
    }

    pub fn selected(&self) -> Vec<DocumentId> {
        self.ids.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Drop ids that are no longer in `records`. Called whenever the
    /// displayed collection is replaced. Returns how many were dropped.
    pub fn retain_present(&mut self, records: &[DocumentRecord]) -> usize {
        let present: HashSet<&DocumentId> = records.iter().map(|r| &r.id).collect();
        let before = self.ids.len();
        self.ids.retain(|id| present.contains(id));
        before - self.ids.len()
    }
}

/// Mutation applied to every selected document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAction {
    Archive,
    Restore,
    Bookmark(bool),
}

impl BulkAction {
    pub fn kind(&self) -> MutationKind {
        match self {
            BulkAction::Archive => MutationKind::Archive,
            BulkAction::Restore => MutationKind::Restore,
            BulkAction::Bookmark(_) => MutationKind::Bookmark,
        }
    }
}

impl fmt::Display for BulkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkAction::Archive => f.write_str("archive"),
            BulkAction::Restore => f.write_str("restore"),
            BulkAction::Bookmark(true) => f.write_str("bookmark"),
            BulkAction::Bookmark(false) => f.write_str("unbookmark"),
        }
    }
}

/// Per-id results of a bulk action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkReport {
    pub action: BulkAction,
    pub succeeded: Vec<DocumentId>,
    pub failed: Vec<(DocumentId, String)>,
}

impl BulkReport {
    pub fn new(action: BulkAction) -> Self {
        Self {
            action,
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::DocumentCategory;
    use chrono::Utc;
    use proptest::prelude::*;

    fn doc(id: &str) -> DocumentRecord {
        DocumentRecord {
            id: DocumentId::from(id),
            name: id.to_string(),
            category: DocumentCategory::Photo,
            file_type: "image/png".to_string(),
            pet_id: None,
            is_favorite: false,
            is_archived: false,
            share: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_select_and_toggle() {
        let mut s = SelectionSet::new();
        assert!(s.select("a".into()));
        assert!(!s.select("a".into()));
        assert!(s.toggle("b".into()));
        assert!(!s.toggle("b".into()));
        assert_eq!(s.selected(), vec![DocumentId::from("a")]);
        assert!(s.deselect(&"a".into()));
        assert!(s.is_empty());
    }

    #[test]
    fn test_selection_pruned_on_replacement() {
        let mut s = SelectionSet::new();
        s.select("a".into());
        s.select("b".into());

        let dropped = s.retain_present(&[doc("a"), doc("c")]);
        assert_eq!(dropped, 1);
        assert_eq!(s.selected(), vec![DocumentId::from("a")]);
        assert!(!s.contains(&"b".into()));
    }

    #[test]
    fn test_bulk_action_kinds() {
        assert_eq!(BulkAction::Archive.kind(), MutationKind::Archive);
        assert_eq!(BulkAction::Restore.kind(), MutationKind::Restore);
        assert_eq!(BulkAction::Bookmark(true).kind(), MutationKind::Bookmark);
    }

    proptest! {
        #[test]
        fn prop_retain_present_leaves_only_displayed_ids(
            selected in proptest::collection::btree_set("[a-f]", 0..6),
            displayed in proptest::collection::vec("[a-f]", 0..6),
        ) {
            let mut s = SelectionSet::new();
            for id in &selected {
                s.select(DocumentId::from(id.as_str()));
            }
            let records: Vec<DocumentRecord> = displayed.iter().map(|id| doc(id)).collect();
            s.retain_present(&records);

            for id in s.selected() {
                prop_assert!(displayed.iter().any(|d| d == id.as_str()));
                prop_assert!(selected.contains(id.as_str()));
            }
            let expected = selected.iter().filter(|id| displayed.contains(id)).count();
            prop_assert_eq!(s.len(), expected);
        }
    }
}
