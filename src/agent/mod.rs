mod controller;
pub mod events;
mod loop_detect;
pub mod prompt;

pub use controller::{AgentController, AgentError, ControllerState, TaskOutcome};
pub use events::{AgentEvent, EventSender};
pub use loop_detect::LoopDetector;
