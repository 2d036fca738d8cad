//! Workflow records, the claim protocol, and status synchronization.

pub mod claim;
pub mod model;
pub mod sync;

pub use claim::{ClaimChannel, ClaimCoordinator, ClaimResolution, needs_claim};
pub use model::{StepStatus, Workflow, WorkflowStatus, WorkflowStep};
pub use sync::{StepChange, SubscriptionHandle, WorkflowChange, WorkflowSynchronizer};
