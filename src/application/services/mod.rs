//! Services shared by the use cases.

mod completion;
mod task_factory;

pub use completion::{Completion, CompletionBridge};
pub use task_factory::TaskFactory;
