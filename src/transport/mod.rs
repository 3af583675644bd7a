//! Channel to the health-record service and typed thing methods over it.

mod memory_server;
mod retry;
mod thing_client;
#[allow(clippy::module_inception)]
mod transport;

pub use memory_server::{Fault, MemoryThingServer};
pub use retry::{RetryingTransport, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_SLEEP};
pub use thing_client::{
    ChangeBatch, GetThingChangesRequest, GetThingsRequest, GetThingsResponse, PutThingsRequest,
    PutThingsResponse, RemoveThingsRequest, ThingClient,
};
pub use transport::{
    MethodName, MethodRequest, MethodResponse, ServerStatus, ServerStatusCode, Transport,
};
