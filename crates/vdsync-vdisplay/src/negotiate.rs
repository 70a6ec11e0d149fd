//! Resolution negotiation.
//!
//! Maps what a client asked for onto what the virtual display can show.
//! Order is fixed: overrides first, then an exact match, then refresh-only
//! degradation along [`REFRESH_LADDER`]. Width and height are never changed
//! by the fallback.

use crate::mode::{Mode, ModeRequest, OverrideTable};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Refresh rates tried, in order, when the target refresh is unsupported.
pub const REFRESH_LADDER: [u32; 3] = [90, 60, 30];

/// Why the achieved mode is what it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationReason {
    ExactMatch,
    OverrideApplied,
    RefreshDegraded,
}

/// The outcome of a successful negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AchievedMode {
    /// Mode to apply.
    pub mode: Mode,
    /// Mode the client asked for, before overrides.
    pub requested: Mode,
    pub degraded: bool,
    pub reason: NegotiationReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no achievable mode for {target} (requested {requested})")]
pub struct NoAchievableMode {
    pub requested: Mode,
    /// The target after overrides.
    pub target: Mode,
}

pub fn negotiate(
    request: &ModeRequest,
    capabilities: &[Mode],
    overrides: &OverrideTable,
) -> Result<AchievedMode, NoAchievableMode> {
    let requested = request.mode;
    let (target, reason) = match overrides.lookup(&requested) {
        Some(rule) => (rule.to, NegotiationReason::OverrideApplied),
        None => (requested, NegotiationReason::ExactMatch),
    };

    if capabilities.contains(&target) {
        return Ok(AchievedMode {
            mode: target,
            requested,
            degraded: false,
            reason,
        });
    }

    REFRESH_LADDER
        .iter()
        .filter(|&&hz| hz < target.refresh_hz)
        .map(|&hz| target.with_refresh(hz))
        .find(|candidate| capabilities.contains(candidate))
        .map(|mode| AchievedMode {
            mode,
            requested,
            degraded: true,
            reason: NegotiationReason::RefreshDegraded,
        })
        .ok_or(NoAchievableMode { requested, target })
}
