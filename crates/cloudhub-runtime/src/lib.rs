//! CloudHub Runtime
//!
//! The dispatch engine of the hub:
//! - [`NodeQueue`]: bounded FIFO buffers per edge node
//! - [`QueueRegistry`]: node → queue and node → session mapping, routing
//! - [`Dispatcher`]: drains the cloud ingress stream into node queues
//! - [`Session`]: binds one connection to one node queue
//! - [`HubBuilder`] / [`HubHandle`]: supervisor wiring, startup and shutdown
//!
//! Protocol adapters implement [`ProtocolServer`] in their own crates.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod builder;
pub mod channel;
pub mod dispatcher;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;
pub mod supervisor;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use builder::{HubBuilder, HubHandle, ShutdownReport};
pub use channel::{
    create_cloud_sink, create_ingress_channel, CloudSinkReceiver, CloudSinkSender, IngressItem,
    IngressReceiver, IngressSender,
};
pub use dispatcher::{DispatchStats, Dispatcher};
pub use queue::{Checkout, NodeQueue, QueueStats};
pub use registry::{QueueRegistry, RegistryStats, Route};
pub use server::{ProtocolServer, ServerContext};
pub use session::{next_session_id, CloseReason, Session, SessionHandle, SessionState};
pub use supervisor::{TaskHealthStatus, TaskSupervisor};

// Re-export the core crate for protocol adapters and embedders
pub use cloudhub_core;
