// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory pressure signals from the host.

/// How hard the host asks caches to shrink, ordered from mild to severe.
///
/// The numeric values follow the host platform's trim levels, so ordering comparisons mean the
/// same thing as there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrimLevel {
    /// Running normally, memory is getting moderately low.
    RunningModerate = 5,
    /// Running normally, memory is low.
    RunningLow = 10,
    /// Running, but the system is about to kill background work.
    RunningCritical = 15,
    /// The UI is no longer visible.
    UiHidden = 20,
    /// The process is in the background list.
    Background = 40,
    /// The process is in the middle of the background list.
    Moderate = 60,
    /// The process is next to be killed.
    Complete = 80,
}

/// What a bounded cache should do for a given [`TrimLevel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrimAction {
    Clear,
    Halve,
    Keep,
}

impl TrimLevel {
    pub(crate) fn action(self) -> TrimAction {
        if self >= Self::Background {
            TrimAction::Clear
        } else if self >= Self::UiHidden || self == Self::RunningCritical {
            TrimAction::Halve
        } else {
            TrimAction::Keep
        }
    }
}

/// Scales the memory cache and reuse pool budgets for a part of the host application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemoryCategory {
    /// Half the configured budgets.
    Low,
    /// The configured budgets.
    #[default]
    Normal,
    /// One and a half times the configured budgets.
    High,
}

impl MemoryCategory {
    /// The budget multiplier.
    #[must_use]
    pub fn multiplier(self) -> f32 {
        match self {
            Self::Low => 0.5,
            Self::Normal => 1.0,
            Self::High => 1.5,
        }
    }
}

/// Scales `base` by `multiplier`, rounding to the nearest byte.
#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    reason = "budgets are far below the f64 mantissa and multipliers are positive"
)]
pub(crate) fn scale_budget(base: usize, multiplier: f32) -> usize {
    (base as f64 * f64::from(multiplier)).round() as usize
}
