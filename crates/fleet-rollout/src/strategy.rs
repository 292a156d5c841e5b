//! Rollout parameters.

pub use fleet_state::CanaryConfig;

use crate::error::{RolloutError, RolloutResult};

/// Fleets smaller than this skip the staged rollout.
pub const SMALL_FLEET_THRESHOLD: u32 = 5;

/// Reject configurations the state machine cannot run.
pub fn validate(config: &CanaryConfig) -> RolloutResult<()> {
    if !(1..=100).contains(&config.canary_percentage) {
        return Err(RolloutError::InvalidConfig(format!(
            "canary_percentage must be between 1 and 100, got {}",
            config.canary_percentage
        )));
    }
    if config.gradual_steps.is_empty() {
        return Err(RolloutError::InvalidConfig(
            "gradual_steps must not be empty".to_string(),
        ));
    }
    if config.gradual_steps.windows(2).any(|w| w[0] >= w[1]) {
        return Err(RolloutError::InvalidConfig(
            "gradual_steps must be strictly increasing".to_string(),
        ));
    }
    if config.gradual_steps.last() != Some(&100) {
        return Err(RolloutError::InvalidConfig(
            "the last gradual step must be 100".to_string(),
        ));
    }
    if !(0.0..=100.0).contains(&config.success_threshold) {
        return Err(RolloutError::InvalidConfig(format!(
            "success_threshold must be between 0 and 100, got {}",
            config.success_threshold
        )));
    }
    if config.auto_advance && config.stability_period_ms == 0 {
        return Err(RolloutError::InvalidConfig(
            "stability_period_ms must be positive when auto_advance is on".to_string(),
        ));
    }
    Ok(())
}

/// Apply the small-fleet rule: every site is a canary, one step at 100%.
pub fn normalize(config: &CanaryConfig, total_sites: u32) -> CanaryConfig {
    if total_sites >= SMALL_FLEET_THRESHOLD {
        return config.clone();
    }
    CanaryConfig {
        canary_percentage: 100,
        gradual_steps: vec![100],
        ..config.clone()
    }
}
