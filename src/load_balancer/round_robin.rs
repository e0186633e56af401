//! Weighted round-robin target selection.
//!
//! # Algorithm
//! Rotate through targets in order, visiting each `weight` times per
//! cycle. Targets inside their failure cooldown are skipped; a retrying
//! session therefore lands on a different upstream while the failing one
//! sits out its window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::routing::Target;

/// Per-worker, per-route selection state.
#[derive(Debug, Default)]
pub struct TargetPicker {
    position: u64,
    cooldowns: HashMap<String, Instant>,
}

impl TargetPicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next target. Cooling-down targets are skipped unless all
    /// targets are cooling down.
    pub fn pick<'a>(&mut self, targets: &'a [Target], now: Instant) -> Option<&'a Target> {
        if targets.is_empty() {
            return None;
        }

        let usable: Vec<&Target> = targets
            .iter()
            .filter(|t| !self.cooling_down(t, now))
            .collect();

        let pool: Vec<&Target> = if usable.is_empty() {
            targets.iter().collect()
        } else {
            usable
        };

        let total_weight: u64 = pool.iter().map(|t| t.weight as u64).sum();
        let mut slot = self.position % total_weight;
        self.position = self.position.wrapping_add(1);

        for target in pool {
            let weight = target.weight as u64;
            if slot < weight {
                return Some(target);
            }
            slot -= weight;
        }

        unreachable!("slot always lands inside total_weight");
    }

    /// Put a target into cooldown after an upstream failure.
    pub fn mark_failure(&mut self, target: &Target, now: Instant, cooldown: Duration) {
        self.cooldowns.insert(target.authority(), now + cooldown);
    }

    fn cooling_down(&self, target: &Target, now: Instant) -> bool {
        match self.cooldowns.get(&target.authority()) {
            Some(until) => now < *until,
            None => false,
        }
    }
}
