//! Data model for cached things, pending operations and queries.

pub mod pending_operation;
mod query;
mod thing;
pub mod type_registry;

pub use pending_operation::{PendingMethod, PendingOperation, PendingState};
pub use query::{PendingThing, ThingQuery, ThingQueryResult};
pub use thing::{Thing, ThingKey};
pub use type_registry::{ThingTypeInfo, ThingTypeRegistry};
