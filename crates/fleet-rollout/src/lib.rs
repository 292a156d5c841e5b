//! fleet-rollout — staged (canary) rollouts across a fleet.
//!
//! A canary rollout deploys an artifact to a random sample of the target
//! sites first, waits a stability period, and then either widens the
//! rollout step by step or rolls it back when too many sites failed.
//!
//! # Components
//!
//! - **`strategy`** — rollout parameters, validation, small-fleet handling
//! - **`controller`** — pure selection and step arithmetic
//! - **`timers`** — cancellable one-shot stability checks
//! - **`orchestrator`** — the persisted state machine

pub mod controller;
pub mod error;
pub mod orchestrator;
pub mod strategy;
pub mod timers;

pub use controller::{RolloutMetrics, StepPlan};
pub use error::{RolloutError, RolloutResult};
pub use orchestrator::{AdvanceOutcome, CanaryDeploymentOrchestrator, NewCanary};
pub use strategy::CanaryConfig;
pub use timers::StabilityTimers;
