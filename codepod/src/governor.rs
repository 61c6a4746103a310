//! Resource governor: per-instance ceilings and pool capacity.
//!
//! Capacity is handed out as [`CapacitySlot`] guards. A slot is released when
//! its guard drops, so a provisioning path that bails early gives the slot
//! back without any explicit bookkeeping.
//!
//! Usage enforcement is a one-shot gate right after provisioning
//! ([`ResourceGovernor::check_resources`]); afterwards the health monitor only
//! asks for an advisory [`UsageLevel`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use codepod_protocol::ResourceCeiling;

use crate::config::ResourceConfig;
use crate::error::RuntimeError;
use crate::runtime::InstanceStats;

/// Advisory classification of sampled usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageLevel {
    Normal,
    /// Above the warn threshold; logged and counted, never acted on.
    Warning,
    /// Above the fail threshold.
    Exceeded,
}

#[derive(Debug)]
pub struct ResourceGovernor {
    ceiling: ResourceCeiling,
    max_instances: usize,
    fail_threshold: f64,
    warn_threshold: f64,
    active: Arc<AtomicUsize>,
}

impl ResourceGovernor {
    pub fn new(config: &ResourceConfig) -> Self {
        Self {
            ceiling: ResourceCeiling {
                memory_bytes: config.memory_bytes,
                cpu_shares: config.cpu_shares,
            },
            max_instances: config.max_instances,
            fail_threshold: config.fail_threshold,
            warn_threshold: config.warn_threshold,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn ceiling(&self) -> ResourceCeiling {
        self.ceiling
    }

    pub fn capacity(&self) -> usize {
        self.max_instances
    }

    /// Number of slots currently held.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Take a capacity slot, or `None` when the pool is full.
    pub fn try_reserve(&self) -> Option<CapacitySlot> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.max_instances {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(CapacitySlot {
                        active: Arc::clone(&self.active),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Memory byte count above which an instance fails the post-start gate.
    pub fn memory_fail_limit(&self) -> u64 {
        (self.ceiling.memory_bytes as f64 * self.fail_threshold) as u64
    }

    /// Post-provisioning gate: fail if memory exceeds the fail threshold.
    pub fn check_resources(
        &self,
        project_id: &str,
        stats: &InstanceStats,
    ) -> Result<(), RuntimeError> {
        let limit = self.memory_fail_limit();
        if stats.memory_usage > limit {
            return Err(RuntimeError::ResourceExceeded {
                project_id: project_id.to_string(),
                resource: "memory".into(),
                usage: stats.memory_usage,
                limit,
            });
        }
        Ok(())
    }

    /// Classify a sample against the thresholds. CPU percent is relative to
    /// one full core, so 100.0 counts as a ratio of 1.0.
    pub fn assess(&self, stats: &InstanceStats) -> UsageLevel {
        let ratio = self.usage_ratio(stats);
        if ratio > self.fail_threshold {
            UsageLevel::Exceeded
        } else if ratio > self.warn_threshold {
            UsageLevel::Warning
        } else {
            UsageLevel::Normal
        }
    }

    fn usage_ratio(&self, stats: &InstanceStats) -> f64 {
        let memory = if self.ceiling.memory_bytes == 0 {
            0.0
        } else {
            stats.memory_usage as f64 / self.ceiling.memory_bytes as f64
        };
        let cpu = stats.cpu_percent / 100.0;
        memory.max(cpu)
    }
}

/// A held unit of pool capacity; dropping it frees the unit.
#[derive(Debug)]
pub struct CapacitySlot {
    active: Arc<AtomicUsize>,
}

impl Drop for CapacitySlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
