//! Turn orchestration and the history that gives replies their context.

pub mod history;
pub mod orchestrator;

pub use history::{ConversationHistory, Message, Role};
pub use orchestrator::{
    ConversationOrchestrator, OrchestratorConfig, PlaybackStatus, TurnOutcome, TurnReply,
    TurnStage,
};
