pub mod cancellation;
pub mod context;
pub mod dispatch;
pub mod grants;
pub mod merge;
pub mod model;
pub mod orchestrator;
pub mod permissions;
pub mod safety;
pub mod sequencer;

/// Upper bound on tool invocations executing simultaneously within one
/// turn, regardless of how many read-only tools were requested.
pub const TOOL_CONCURRENCY_CAP: usize = 10;

pub use cancellation::*;
pub use context::*;
pub use dispatch::*;
pub use grants::*;
pub use merge::*;
pub use model::*;
pub use orchestrator::*;
pub use permissions::*;
pub use safety::*;
pub use sequencer::*;
