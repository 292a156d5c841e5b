//! Rollout arithmetic — canary sampling, success rate, next step.
//!
//! Everything here is pure so the state machine's decisions can be tested
//! without a store or a clock.

use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;

use fleet_state::{CanaryDeployment, CanaryPhase, SiteDeploymentStatus, SiteId, SiteRolloutStatus};

/// Sites needed to cover `percentage` of `total`, rounded up.
pub fn sites_for_percentage(total: u32, percentage: u32) -> u32 {
    ((total as u64 * percentage as u64).div_ceil(100) as u32).min(total)
}

/// Size of the canary subset: at least one site when there are any.
pub fn canary_count(total: u32, percentage: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    sites_for_percentage(total, percentage).max(1)
}

/// Pick the canary subset uniformly at random.
pub fn select_canary<R: Rng + ?Sized>(
    sites: &[SiteId],
    percentage: u32,
    rng: &mut R,
) -> Vec<SiteId> {
    let count = canary_count(sites.len() as u32, percentage) as usize;
    let mut shuffled = sites.to_vec();
    shuffled.shuffle(rng);
    shuffled.truncate(count);
    shuffled
}

/// `successful / attempted * 100`, or 100 before anything has reported.
pub fn success_rate(successful: u32, attempted: u32) -> f64 {
    if attempted == 0 {
        return 100.0;
    }
    successful as f64 / attempted as f64 * 100.0
}

/// Snapshot of a canary rollout's site outcomes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RolloutMetrics {
    pub total_sites: u32,
    /// Sites a delivery has been started for.
    pub targeted_sites: u32,
    /// Targeted sites that reported a terminal outcome.
    pub deployed_sites: u32,
    pub successful_sites: u32,
    pub failed_sites: u32,
    /// Sites not yet targeted.
    pub pending_sites: u32,
    pub success_rate: f64,
}

impl RolloutMetrics {
    pub fn from_sites(sites: &[SiteDeploymentStatus]) -> Self {
        let count = |f: &dyn Fn(&SiteDeploymentStatus) -> bool| sites.iter().filter(|s| f(s)).count() as u32;

        let successful = count(&|s| s.status == SiteRolloutStatus::Deployed);
        let failed = count(&|s| s.status == SiteRolloutStatus::Failed);
        let targeted = count(&|s| s.dispatched_at.is_some());
        let deployed = successful + failed;

        Self {
            total_sites: sites.len() as u32,
            targeted_sites: targeted,
            deployed_sites: deployed,
            successful_sites: successful,
            failed_sites: failed,
            pending_sites: sites.len() as u32 - targeted,
            success_rate: success_rate(successful, deployed),
        }
    }

    /// Every targeted site has reported and nothing is left to target.
    pub fn all_settled(&self) -> bool {
        self.pending_sites == 0 && self.deployed_sites == self.total_sites
    }
}

/// What advancing a rollout should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepPlan {
    /// Target `additional` more sites to reach `target_percentage`.
    Deploy {
        step: usize,
        phase: CanaryPhase,
        target_percentage: u32,
        additional: u32,
    },
    /// All steps are done.
    Complete,
}

/// Plan the step after the rollout's current one.
///
/// `already_targeted` counts sites a delivery was started for; the plan
/// only ever adds the difference to the next step's target.
pub fn plan_next_step(canary: &CanaryDeployment, already_targeted: u32) -> StepPlan {
    let next = match canary.current_phase {
        CanaryPhase::Canary => 0,
        CanaryPhase::Gradual | CanaryPhase::Full => canary.current_step + 1,
        CanaryPhase::Completed | CanaryPhase::Failed | CanaryPhase::RolledBack => {
            return StepPlan::Complete;
        }
    };
    let Some(&percentage) = canary.config.gradual_steps.get(next) else {
        return StepPlan::Complete;
    };

    let target = sites_for_percentage(canary.total_sites, percentage);
    StepPlan::Deploy {
        step: next,
        phase: if percentage >= 100 {
            CanaryPhase::Full
        } else {
            CanaryPhase::Gradual
        },
        target_percentage: percentage,
        additional: target.saturating_sub(already_targeted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::{CanaryConfig, DeploymentKind, TargetType};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn ids(n: usize) -> Vec<SiteId> {
        (0..n).map(|i| format!("site-{i}")).collect()
    }

    fn canary(phase: CanaryPhase, step: usize, total: u32) -> CanaryDeployment {
        CanaryDeployment {
            id: "c1".to_string(),
            deployment_type: DeploymentKind::Content,
            resource_id: "video-1".to_string(),
            target_type: TargetType::Group,
            target_id: "g".to_string(),
            config: CanaryConfig::default(),
            current_phase: phase,
            current_step: step,
            total_sites: total,
            rollback_reason: None,
            created_by: "ops".to_string(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn status(dispatched: bool, status: SiteRolloutStatus) -> SiteDeploymentStatus {
        SiteDeploymentStatus {
            canary_id: "c1".to_string(),
            site_id: "s".to_string(),
            site_name: "s".to_string(),
            phase: CanaryPhase::Canary,
            status,
            dispatched_at: dispatched.then_some(1),
            deployed_at: None,
            error_message: None,
            deployment_id: None,
            rollback_sent: false,
        }
    }

    #[test]
    fn canary_size_rounds_up_with_minimum_one() {
        assert_eq!(canary_count(10, 10), 1);
        assert_eq!(canary_count(11, 10), 2);
        assert_eq!(canary_count(5, 1), 1);
        assert_eq!(canary_count(3, 100), 3);
        assert_eq!(canary_count(0, 10), 0);
    }

    #[test]
    fn canary_size_matches_formula_across_fleets() {
        let mut rng = StdRng::seed_from_u64(7);
        for total in 5..60usize {
            for pct in [1u32, 5, 10, 33, 50, 99, 100] {
                let expected = ((total as u32 * pct).div_ceil(100)).max(1);
                assert_eq!(select_canary(&ids(total), pct, &mut rng).len() as u32, expected);
            }
        }
    }

    #[test]
    fn selection_has_no_duplicates() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut picked = select_canary(&ids(40), 50, &mut rng);
        picked.sort();
        picked.dedup();
        assert_eq!(picked.len(), 20);
    }

    #[test]
    fn success_rate_is_optimistic_without_data() {
        assert_eq!(success_rate(0, 0), 100.0);
        assert_eq!(success_rate(0, 1), 0.0);
        assert_eq!(success_rate(3, 4), 75.0);
    }

    #[test]
    fn success_rate_stays_in_range() {
        for attempted in 0..20 {
            for successful in 0..=attempted {
                let rate = success_rate(successful, attempted);
                assert!((0.0..=100.0).contains(&rate));
            }
        }
    }

    #[test]
    fn metrics_count_terminal_sites() {
        let sites = vec![
            status(true, SiteRolloutStatus::Deployed),
            status(true, SiteRolloutStatus::Failed),
            status(true, SiteRolloutStatus::Pending),
            status(false, SiteRolloutStatus::Pending),
        ];
        let m = RolloutMetrics::from_sites(&sites);
        assert_eq!(m.total_sites, 4);
        assert_eq!(m.targeted_sites, 3);
        assert_eq!(m.deployed_sites, 2);
        assert_eq!(m.pending_sites, 1);
        assert_eq!(m.success_rate, 50.0);
        assert!(!m.all_settled());
    }

    #[test]
    fn first_advance_targets_first_step() {
        let plan = plan_next_step(&canary(CanaryPhase::Canary, 0, 10), 1);
        assert_eq!(
            plan,
            StepPlan::Deploy {
                step: 0,
                phase: CanaryPhase::Gradual,
                target_percentage: 25,
                additional: 2,
            }
        );
    }

    #[test]
    fn last_step_is_full_then_complete() {
        let plan = plan_next_step(&canary(CanaryPhase::Gradual, 2, 10), 8);
        assert_eq!(
            plan,
            StepPlan::Deploy {
                step: 3,
                phase: CanaryPhase::Full,
                target_percentage: 100,
                additional: 2,
            }
        );
        assert_eq!(plan_next_step(&canary(CanaryPhase::Full, 3, 10), 10), StepPlan::Complete);
    }

    #[test]
    fn advance_never_reassigns_targeted_sites() {
        // More sites already targeted than the step asks for.
        let plan = plan_next_step(&canary(CanaryPhase::Canary, 0, 10), 4);
        assert!(matches!(plan, StepPlan::Deploy { additional: 0, .. }));
    }
}
