//! Process-wide orchestration: the bot orchestrator and the typed event
//! bus.

pub mod event_bus;
pub mod orchestrator;

pub use event_bus::{EventBus, EventHandler, Subscription};
pub use orchestrator::{BotOrchestrator, LiveDeps, OrchestratorError, MAX_BOTS_PER_USER};
