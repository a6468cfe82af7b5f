//! Percentage bands reserved per phase.
//!
//! Bands are contiguous and non-overlapping; 100 is only ever reported by the
//! status poll once the run is done and the last-run record exists.

use crate::import::state::ImportPhase;

/// Inclusive start / exclusive-ish end of each phase's reserved band.
pub fn band(phase: ImportPhase) -> (u8, u8) {
    match phase {
        ImportPhase::Bootstrap => (0, 2),
        ImportPhase::Moves => (2, 20),
        ImportPhase::Creatures => (20, 60),
        ImportPhase::Evolutions => (60, 85),
        ImportPhase::Types => (85, 98),
        ImportPhase::Finalize => (98, 100),
    }
}

/// Scale a completed fraction into the phase's band.
pub fn banded(phase: ImportPhase, fraction: f64) -> u8 {
    let (lo, hi) = band(phase);
    let f = fraction.clamp(0.0, 1.0);
    let span = (hi - lo) as f64;
    (lo as f64 + span * f).floor() as u8
}

/// Percent for a simple batch phase at `done` of `total` records.
pub fn phase_percent(phase: ImportPhase, done: usize, total: usize) -> u8 {
    if total == 0 {
        return band(phase).1;
    }
    banded(phase, done as f64 / total as f64)
}

/// Percent for the evolutions phase: sub-steps share the band equally.
pub fn substep_percent(step_idx: usize, steps: usize, done: usize, total: usize) -> u8 {
    if steps == 0 {
        return band(ImportPhase::Evolutions).1;
    }
    let inner = if total == 0 {
        1.0
    } else {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    };
    banded(
        ImportPhase::Evolutions,
        (step_idx as f64 + inner) / steps as f64,
    )
}
