//! Incorporates a freshly fetched page into the visible list.
//!
//! List views are consumed two ways from the same data source: page jumps
//! (replace) and forward-only incremental loading (append).

use crate::query::ListEntity;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Replace,
    Append,
}

pub fn merge_pages<T: ListEntity>(previous: Vec<T>, fresh: Vec<T>, mode: AccessMode) -> Vec<T> {
    match mode {
        AccessMode::Replace => fresh,
        AccessMode::Append => {
            let mut merged = previous;
            let mut index: HashMap<Uuid, usize> = merged
                .iter()
                .enumerate()
                .map(|(i, item)| (item.id(), i))
                .collect();
            for item in fresh {
                match index.get(&item.id()) {
                    // Re-fetched: update in place, relative order preserved.
                    Some(&i) => merged[i] = item,
                    None => {
                        index.insert(item.id(), merged.len());
                        merged.push(item);
                    }
                }
            }
            merged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: Uuid,
        label: String,
    }

    impl ListEntity for Row {
        fn id(&self) -> Uuid {
            self.id
        }
        fn status_id(&self) -> Option<Uuid> {
            None
        }
        fn sort_value(&self, _field: &str) -> Value {
            Value::String(self.label.clone())
        }
        fn matches_search(&self, needle: &str) -> bool {
            self.label.to_lowercase().contains(needle)
        }
    }

    fn row(id: Uuid, label: &str) -> Row {
        Row {
            id,
            label: label.to_string(),
        }
    }

    #[test]
    fn test_replace_discards_previous() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let merged = merge_pages(
            vec![row(a, "old")],
            vec![row(b, "new")],
            AccessMode::Replace,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, b);
    }

    #[test]
    fn test_append_updates_in_place_and_preserves_order() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let previous = vec![row(a, "a1"), row(b, "b1")];
        let fresh = vec![row(b, "b2"), row(c, "c1")];
        let merged = merge_pages(previous, fresh, AccessMode::Append);

        assert_eq!(merged.len(), 3);
        // a keeps its slot, b is updated where it was, c lands at the end.
        assert_eq!(merged[0].id, a);
        assert_eq!(merged[1].id, b);
        assert_eq!(merged[1].label, "b2");
        assert_eq!(merged[2].id, c);
    }

    #[test]
    fn test_append_to_empty() {
        let a = Uuid::new_v4();
        let merged = merge_pages(Vec::new(), vec![row(a, "a")], AccessMode::Append);
        assert_eq!(merged.len(), 1);
    }
}
