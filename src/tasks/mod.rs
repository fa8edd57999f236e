pub mod claim;
pub mod lifecycle;
pub mod reconciler;
pub mod store;
pub mod task;

pub use claim::{ClaimOutcome, ClaimProtocol};
pub use lifecycle::{Actor, TaskLifecycle, Transition};
pub use reconciler::Reconciler;
pub use store::{PendingWatch, TaskStore, TaskWatch};
pub use task::{TaskId, TaskRecord, TaskStatus, DEFAULT_LANGUAGE};
