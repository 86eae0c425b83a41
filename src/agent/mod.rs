pub mod dispatch;
pub mod gate;
pub mod locks;
pub mod media;
pub mod orchestrator;
pub mod records;
pub mod schema;

pub use dispatch::{DispatchOutcome, ExecutionContext, ToolDispatcher};
pub use gate::{can_respond, Eligibility};
pub use locks::ConversationLocks;
pub use media::{MediaPreprocessor, MediaUnderstanding};
pub use orchestrator::{Orchestrator, ReplyOutcome, RunOutcome, RunRequest};
