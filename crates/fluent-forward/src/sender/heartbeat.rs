// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Liveness signals consumed by [`crate::sender::multi::MultiSender`].
//!
//! The probing transport itself lives outside this crate; whatever pings collectors reports
//! its verdicts through a [`Heartbeat`] implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub trait Heartbeat: Send + Sync + std::fmt::Debug {
    fn is_alive(&self, target: &str) -> bool;
}

/// Treats every target as alive. Failover then relies on send failures alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAlive;

impl Heartbeat for AlwaysAlive {
    fn is_alive(&self, _target: &str) -> bool {
        true
    }
}

/// Shared table of liveness verdicts, updated by an external health checker.
///
/// Targets that were never reported are considered alive.
#[derive(Debug, Default, Clone)]
pub struct LivenessBoard {
    states: Arc<RwLock<HashMap<String, bool>>>,
}

impl LivenessBoard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, target: &str, alive: bool) {
        #[allow(clippy::expect_used)]
        let mut states = self.states.write().expect("lock poisoned");
        states.insert(target.to_string(), alive);
    }
}

impl Heartbeat for LivenessBoard {
    fn is_alive(&self, target: &str) -> bool {
        #[allow(clippy::expect_used)]
        let states = self.states.read().expect("lock poisoned");
        states.get(target).copied().unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreported_targets_are_alive() {
        let board = LivenessBoard::new();
        assert!(board.is_alive("127.0.0.1:24224"));
    }

    #[test]
    fn test_reports_are_shared_between_clones() {
        let board = LivenessBoard::new();
        let checker = board.clone();
        checker.report("127.0.0.1:24224", false);
        assert!(!board.is_alive("127.0.0.1:24224"));
        checker.report("127.0.0.1:24224", true);
        assert!(board.is_alive("127.0.0.1:24224"));
    }
}
