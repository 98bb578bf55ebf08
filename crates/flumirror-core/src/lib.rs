// flumirror-core: state mirror and command router for the flumirror bridge
//
// A single event loop (`Bridge`) keeps a shadow copy of the manager's
// component tree, publishes snapshots, changes and detail state to the
// broker, and routes inbound polls and commands back upstream.

pub mod bridge;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod projection;
pub mod publisher;
pub mod stream;

mod store;
mod tree;

pub use bridge::Bridge;
pub use command::{
    BatchItem, CommandKind, CommandMessage, CommandOutcome, CommandResult, CommandRouter, ComponentCommand,
    Selector,
};
pub use config::{BridgeConfig, DetailRelease, FlowSelection};
pub use coordinator::ConnectionState;
pub use error::{CoreError, ProjectionError, RouteError};
pub use model::{
    Action, ChangeEnvelope, ChangePayload, ComponentRecord, DetailSnapshot, MessageRecord, Mood, PollOutcome,
};
pub use projection::{FormatTranslator, Projector, Translator};
pub use publisher::Destinations;
pub use stream::{ComponentStream, ComponentWatchStream};

pub use flumirror_api::ConnectFailureKind;
