//! fleet-deploy — delivering artifacts to sites.
//!
//! A deployment names one artifact and a logical target (a site or a
//! group). Starting it resolves the target to concrete sites and delivers
//! to whichever are connected; the rest are caught up by the reconnect
//! hooks in [`hooks`]. Per-site progress is folded into the deployment's
//! aggregate progress and status.

pub mod error;
pub mod hooks;
pub mod orchestrator;
pub mod retry;
pub mod storage;

pub use error::{DeployError, DeployResult};
pub use hooks::PendingDeploymentsHook;
pub use orchestrator::{DeploymentObserver, DeploymentOrchestrator, NewDeployment, ProgressReport};
pub use storage::{LocalObjectStorage, ObjectStorage};
