//! fleet-commands — typed commands to sites.
//!
//! - **`dispatcher`** — sends a command to a connected site, tracks it
//!   until a result arrives, and fails it when its budget runs out
//! - **`queue`** — parks queueable commands for offline sites and replays
//!   them, urgent-first, when the site reconnects

pub mod dispatcher;
pub mod error;
pub mod queue;

pub use dispatcher::{Command, CommandDispatcher, CommandObserver, CommandOutcome};
pub use error::{CommandError, CommandResult};
pub use queue::{CommandQueue, QueueOptions, QueueOutcome, ReplaySummary};
