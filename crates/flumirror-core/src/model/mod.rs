// ── Domain model ──
//
// Records and envelopes the bridge publishes, decoupled from the
// transport-level node types.

mod component;
mod event;
mod mood;

pub use component::{ComponentRecord, DetailSnapshot, MessageRecord, PollOutcome};
pub use event::{Action, ChangeEnvelope, ChangePayload};
pub use mood::Mood;
