// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Runtime control: the global pause switch and the fencing epoch.
//!
//! `RuntimeControl` is a singleton row. Its `control_epoch` is the global
//! fencing token: every claim (dispatch or outbox entry) stamps the epoch it
//! observed, and every finalize/mark-* re-checks it. Once the operator plane
//! bumps the epoch, no worker still operating under the old epoch can land
//! its result or deliver an effect.

use serde::{Deserialize, Serialize};

/// Monotonic fencing counter. Distinct from any other integer in the system;
/// a dispatch epoch and an outbox epoch are only ever compared through this
/// type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ControlEpoch(pub i64);

impl ControlEpoch {
    pub const INITIAL: ControlEpoch = ControlEpoch(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for ControlEpoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a global pause applies to in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseMode {
    /// Stop admitting new claims; in-flight dispatches run to completion.
    Soft,
    /// Stop admitting new claims and void the current generation of claims
    /// via an epoch bump.
    Hard,
}

impl PauseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PauseMode::Soft => "soft",
            PauseMode::Hard => "hard",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "soft" => Some(PauseMode::Soft),
            "hard" => Some(PauseMode::Hard),
            _ => None,
        }
    }
}

/// The singleton control row. Created lazily on first access; mutated only
/// by explicit operator actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeControl {
    pub processing_enabled: bool,
    pub pause_mode: PauseMode,
    pub control_epoch: ControlEpoch,
    pub max_concurrent_dispatches: i32,
}

impl Default for RuntimeControl {
    fn default() -> Self {
        Self {
            processing_enabled: true,
            pause_mode: PauseMode::Soft,
            control_epoch: ControlEpoch::INITIAL,
            max_concurrent_dispatches: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_increments_strictly() {
        let e = ControlEpoch::INITIAL;
        assert_eq!(e.next(), ControlEpoch(1));
        assert_eq!(e.next().next(), ControlEpoch(2));
        assert!(e < e.next());
    }

    #[test]
    fn pause_mode_round_trips_through_storage_strings() {
        for mode in [PauseMode::Soft, PauseMode::Hard] {
            assert_eq!(PauseMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(PauseMode::parse("loud"), None);
    }
}
