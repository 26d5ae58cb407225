//! Pure backpressure policy for the ssh-data path (spec.md §4.5, §8
//! invariant 5). No I/O, no state beyond what's passed in — the adapter
//! owns the actual `paused` flag and timers.

/// What the adapter should do to the SSH shell's readable side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureAction {
    None,
    Pause,
    Resume,
}

/// `A` is the transport's `bufferedAmount` (`None` when the transport
/// doesn't expose the metric), `high_water` is the configured
/// `socketHighWaterMark`, `paused` is the adapter's current flag.
///
/// - `A == None` -> `None` (no metric, no action).
/// - `A >= H && !paused` -> `Pause`.
/// - `A < H/4 && paused` -> `Resume`.
/// - else -> `None`.
pub fn compute_backpressure_action(
    buffered_amount: Option<usize>,
    high_water: usize,
    paused: bool,
) -> BackpressureAction {
    let Some(amount) = buffered_amount else {
        return BackpressureAction::None;
    };

    let low_water = high_water / 4;

    if amount >= high_water && !paused {
        BackpressureAction::Pause
    } else if amount < low_water && paused {
        BackpressureAction::Resume
    } else {
        BackpressureAction::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: usize = 16 * 1024;

    #[test]
    fn no_metric_is_a_no_op() {
        assert_eq!(compute_backpressure_action(None, H, false), BackpressureAction::None);
        assert_eq!(compute_backpressure_action(None, H, true), BackpressureAction::None);
    }

    #[test]
    fn crossing_high_water_pauses() {
        assert_eq!(compute_backpressure_action(Some(H), H, false), BackpressureAction::Pause);
        assert_eq!(compute_backpressure_action(Some(H + 1), H, false), BackpressureAction::Pause);
    }

    #[test]
    fn below_high_water_does_not_pause() {
        assert_eq!(compute_backpressure_action(Some(H - 1), H, false), BackpressureAction::None);
    }

    #[test]
    fn already_paused_stays_paused_until_below_low_water() {
        assert_eq!(compute_backpressure_action(Some(H), H, true), BackpressureAction::None);
        assert_eq!(compute_backpressure_action(Some(H / 4), H, true), BackpressureAction::None);
        assert_eq!(compute_backpressure_action(Some(H / 4 - 1), H, true), BackpressureAction::Resume);
    }

    #[test]
    fn not_paused_never_resumes() {
        assert_eq!(compute_backpressure_action(Some(0), H, false), BackpressureAction::None);
    }

    #[test]
    fn zero_high_water_never_resumes_since_low_water_is_zero() {
        assert_eq!(compute_backpressure_action(Some(0), 0, true), BackpressureAction::None);
    }
}
