//! Pluggable scheduling policies
//!
//! Load balancing and deadline-aware selection are extension points. The
//! defaults installed by [`super::Scheduler::new`] observe and never act.

use alloc::vec::Vec;

use super::entity::SchedEntity;

/// Per-CPU load classification produced by `balance_load`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Mean load over all CPUs, rounded down
    pub average: u64,
    /// CPUs whose load exceeds `average + threshold`
    pub overloaded: Vec<usize>,
    /// CPUs whose load is below `average - threshold`
    pub underloaded: Vec<usize>,
}

impl LoadReport {
    pub fn is_balanced(&self) -> bool {
        self.overloaded.is_empty() && self.underloaded.is_empty()
    }
}

/// Acts on a load classification
pub trait LoadBalancer: Send + Sync {
    fn balance(&self, report: &LoadReport);
}

/// Balancer that leaves every thread where it is
#[derive(Debug, Default)]
pub struct NoMigration;

impl LoadBalancer for NoMigration {
    fn balance(&self, report: &LoadReport) {
        if !report.is_balanced() {
            log::trace!(
                "load imbalance: avg {} over {:?} under {:?}",
                report.average,
                report.overloaded,
                report.underloaded
            );
        }
    }
}

/// Chooses among ready Deadline entities when no RealTime or Fair entity
/// is ready
pub trait DeadlinePolicy: Send + Sync {
    /// Index into `candidates` of the entity to run, if any
    fn select(&self, cpu: usize, candidates: &[&SchedEntity]) -> Option<usize>;
}

/// Deadline entities are only accounted, never selected
#[derive(Debug, Default)]
pub struct AccountingOnly;

impl DeadlinePolicy for AccountingOnly {
    fn select(&self, _cpu: usize, _candidates: &[&SchedEntity]) -> Option<usize> {
        None
    }
}

/// Earliest deadline first among entities with budget left
#[derive(Debug, Default)]
pub struct EarliestDeadline;

impl DeadlinePolicy for EarliestDeadline {
    fn select(&self, _cpu: usize, candidates: &[&SchedEntity]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .filter(|(_, se)| se.deadline.runtime > 0)
            .min_by_key(|(_, se)| se.deadline.deadline)
            .map(|(i, _)| i)
    }
}
