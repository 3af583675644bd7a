//! Sorted collection of type view items.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::type_view_item::TypeViewItem;

/// Items kept in [`TypeViewItem::compare_to_item`] order, at most one per id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeViewItems {
    items: Vec<TypeViewItem>,
}

impl TypeViewItems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from unsorted items. Later duplicates of an id replace earlier ones.
    pub fn from_items(items: impl IntoIterator<Item = TypeViewItem>) -> Self {
        let mut result = Self::new();
        for item in items {
            result.add(item);
        }
        result
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TypeViewItem> {
        self.items.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeViewItem> {
        self.items.iter()
    }

    pub fn index_of_id(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.key.id == id)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.index_of_id(id).is_some()
    }

    pub fn item_for_id(&self, id: &str) -> Option<&TypeViewItem> {
        self.index_of_id(id).map(|i| &self.items[i])
    }

    pub fn first_date(&self) -> Option<DateTime<Utc>> {
        self.items.first().map(|item| item.date)
    }

    pub fn last_date(&self) -> Option<DateTime<Utc>> {
        self.items.last().map(|item| item.date)
    }

    /// Index of the item whose date is closest to `date`.
    pub fn index_of_closest_date(&self, date: DateTime<Utc>) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .min_by_key(|(_, item)| (item.date - date).num_milliseconds().abs())
            .map(|(i, _)| i)
    }

    fn insertion_index(&self, item: &TypeViewItem) -> usize {
        self.items
            .binary_search_by(|existing| existing.compare_to_item(item))
            .unwrap_or_else(|i| i)
    }

    /// Insert `item`, replacing any item with the same id. Returns its index.
    pub fn add(&mut self, item: TypeViewItem) -> usize {
        self.remove_by_id(&item.key.id);
        let index = self.insertion_index(&item);
        self.items.insert(index, item);
        index
    }

    pub fn remove_by_id(&mut self, id: &str) -> Option<TypeViewItem> {
        let index = self.index_of_id(id)?;
        Some(self.items.remove(index))
    }

    /// Replace the item with id `id` by `item`.
    ///
    /// The slot is reused when `item` still sorts between its neighbors;
    /// otherwise the item moves to its sorted position. Returns the final
    /// index, or `None` if `id` was not present.
    pub fn replace_by_id(&mut self, id: &str, item: TypeViewItem) -> Option<usize> {
        let index = self.index_of_id(id)?;
        if item.key.id != id {
            // The new id must not appear twice
            if let Some(other) = self.index_of_id(&item.key.id) {
                self.items.remove(other);
                return self.replace_by_id(id, item);
            }
        }
        let fits_before = index == 0
            || self.items[index - 1].compare_to_item(&item) != Ordering::Greater;
        let fits_after = index + 1 >= self.items.len()
            || item.compare_to_item(&self.items[index + 1]) != Ordering::Greater;
        if fits_before && fits_after {
            self.items[index] = item;
            Some(index)
        } else {
            self.items.remove(index);
            Some(self.add(item))
        }
    }

    /// Keep at most `max` items, dropping the oldest.
    pub fn truncate(&mut self, max: usize) {
        self.items.truncate(max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ThingKey;
    use chrono::TimeZone;

    fn item(id: &str, day: u32) -> TypeViewItem {
        TypeViewItem::new(
            Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            ThingKey::new(id, "1"),
        )
    }

    fn ids(items: &TypeViewItems) -> Vec<&str> {
        items.iter().map(|i| i.id()).collect()
    }

    #[test]
    fn test_order_is_date_descending_then_id() {
        let items = TypeViewItems::from_items(vec![
            item("c", 1),
            item("b", 3),
            item("a", 3),
            item("d", 2),
        ]);
        assert_eq!(ids(&items), vec!["a", "b", "d", "c"]);
        assert_eq!(items.first_date(), Some(item("x", 3).date));
        assert_eq!(items.last_date(), Some(item("x", 1).date));
    }

    #[test]
    fn test_add_replaces_same_id() {
        let mut items = TypeViewItems::from_items(vec![item("a", 1), item("b", 2)]);
        items.add(item("a", 5));
        assert_eq!(ids(&items), vec!["a", "b"]);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn test_replace_keeps_position_when_ordering_allows() {
        let mut items = TypeViewItems::from_items(vec![item("a", 5), item("local-1", 3), item("c", 1)]);
        let index = items.replace_by_id("local-1", item("server-9", 3)).unwrap();
        assert_eq!(index, 1);
        assert_eq!(ids(&items), vec!["a", "server-9", "c"]);

        // A new date that no longer fits moves the item
        let index = items.replace_by_id("server-9", item("server-9", 9)).unwrap();
        assert_eq!(index, 0);
        assert_eq!(ids(&items), vec!["server-9", "a", "c"]);
        assert!(items.replace_by_id("missing", item("z", 1)).is_none());
    }

    #[test]
    fn test_closest_date() {
        let items = TypeViewItems::from_items(vec![item("a", 20), item("b", 10), item("c", 1)]);
        assert_eq!(items.index_of_closest_date(item("x", 12).date), Some(1));
        assert_eq!(items.index_of_closest_date(item("x", 28).date), Some(0));
        assert_eq!(TypeViewItems::new().index_of_closest_date(item("x", 1).date), None);
    }
}
