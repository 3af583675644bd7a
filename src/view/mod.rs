//! Ordered per-type views over a record cache and their batched refresh.

mod refresher;
mod type_view;
mod type_view_item;
mod type_view_items;

pub use refresher::{MultipleTypeViewRefresher, RefreshOutcome};
pub use type_view::{TypeView, TypeViewData};
pub use type_view_item::TypeViewItem;
pub use type_view_items::TypeViewItems;
