//! Resilient real-time hub connections for chat and notifications.
//!
//! A [`ConnectionManager`] turns "is the user signed in" into "is there a
//! live hub session", reconnecting on its own with a [`BackoffSchedule`] and
//! fanning inbound events out through a [`SubscriberRegistry`]. Outbound calls
//! are best-effort and resolve to an [`InvokeOutcome`] instead of failing.

pub mod adapters;
pub mod backoff;
pub mod capability;
pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use adapters::{ChatChannel, NotificationFeed, SenderRole, ToastSink};
pub use backoff::{BackoffSchedule, RetryPolicy};
pub use capability::CapabilityFlags;
pub use config::{Feature, HubFileConfig};
pub use error::TransportError;
pub use event::{Channel, HubTargets, InboundEvent};
pub use manager::{ConnectionManager, ConnectionState, Credential, ManagerConfig};
pub use registry::{SubscriberRegistry, Subscription};
pub use session::{InvokeOutcome, SkipReason, TransportSession};
pub use transport::{Connector, HubConnector, HubTransport, TransportKind};
