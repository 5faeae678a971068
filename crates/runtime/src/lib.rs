//! The conversation engine: message store, agent loop, tool dispatch,
//! presentation events and session persistence.

pub mod agent_loop;
pub mod conversation;
pub mod dispatch;
pub mod events;
pub mod history;
pub mod prompt;

pub use agent_loop::{AgentLoop, LoopConfig, LoopError, LoopState, TurnOutcome};
pub use conversation::{
    Conversation, ConversationError, HeuristicEstimator, TokenEstimator, TruncationReport,
};
pub use events::{EventSink, PresentationEvent};
pub use prompt::build_system_prompt;

/// Capacity of the presentation event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
