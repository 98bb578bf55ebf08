// flumirror-api: transports for the flumirror state bridge
//
// The upstream side talks to the streaming-server manager and exposes its
// state tree as cached `RemoteNode`s with per-node change listeners. The
// downstream side publishes JSON bodies to a STOMP broker.

pub mod broker;
pub mod error;
pub mod listen;
pub mod manager;
pub mod memory;
pub mod node;
pub mod upstream;
pub mod wire;

pub use broker::{Broker, BrokerConfig, InboundMessage, MemoryBroker, Published, ReconnectConfig, StompBroker};
pub use error::{ConnectFailureKind, Error};
pub use listen::{
    EventReceiver, EventSender, ListenerId, NodeChange, Notification, StateListener, Subscription,
    UpstreamEvent,
};
pub use manager::{ManagerClient, ManagerConfig};
pub use memory::{MemoryUpstream, RecordedCall};
pub use node::{Fields, Message, MessageLevel, NodeId, RemoteNode, RemoteValue, Translatable, ValueShape};
pub use upstream::{RemoteOp, Upstream};
