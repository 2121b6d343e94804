pub mod connection;
pub mod mirror;
pub mod policy;
pub mod queue;
pub mod registry;

pub use connection::{
    connection_target, ConnectError, ConnectionConfig, ConnectionManager, ConnectionStatus,
    DEFAULT_BASE_URL, DEFAULT_HEARTBEAT_SECS,
};
pub use mirror::{ReplayView, SessionMirror};
pub use policy::{ReconnectPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS};
pub use queue::OutboundQueue;
pub use registry::{ClientEvent, ListenerRegistry, Subscription, Topic};
