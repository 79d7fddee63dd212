use protocol::VsyncTiming;

/// Predict the vsync window around `now` from the last presentation the display reported.
///
/// ```text
/// interval 2    ^     ^     ^     ^
///               0--1--2--3--4--5--6--
///               |           |  |
///               last        |  now
///                           previous = 4, next = 6
/// ```
///
/// A presentation time at or after `now` is a clock anomaly and is clamped to `now`. When less
/// than one interval has passed, the window is reported relative to the last presentation.
pub fn snap_to_next_phase(
    last_presentation_time: u64,
    presentation_interval: u64,
    now: u64,
) -> VsyncTiming {
    if last_presentation_time >= now {
        log::error!(
            "[present_pacer] last frame was presented in the future ({last_presentation_time}), clamping to now ({now})"
        );
        return VsyncTiming {
            previous_vsync: now,
            next_vsync: now.saturating_add(presentation_interval),
        };
    }

    let time_since_last_presentation = now - last_presentation_time;
    if time_since_last_presentation < presentation_interval {
        return VsyncTiming {
            previous_vsync: time_since_last_presentation,
            next_vsync: time_since_last_presentation.saturating_add(presentation_interval),
        };
    }
    if presentation_interval == 0 {
        log::warn!("[present_pacer] display reported a zero presentation interval");
        return VsyncTiming {
            previous_vsync: now,
            next_vsync: now,
        };
    }

    let phases_passed = time_since_last_presentation / presentation_interval;
    let next_vsync = last_presentation_time
        .saturating_add(presentation_interval.saturating_mul(phases_passed.saturating_add(1)));
    VsyncTiming {
        previous_vsync: next_vsync - presentation_interval,
        next_vsync,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(previous_vsync: u64, next_vsync: u64) -> VsyncTiming {
        VsyncTiming {
            previous_vsync,
            next_vsync,
        }
    }

    #[test]
    fn snaps_forward_by_whole_intervals() {
        assert_eq!(snap_to_next_phase(100, 16, 140), timing(132, 148));
    }

    #[test]
    fn exact_boundary_moves_to_the_following_phase() {
        assert_eq!(snap_to_next_phase(100, 16, 132), timing(132, 148));
        assert_eq!(snap_to_next_phase(0, 2, 4), timing(4, 6));
    }

    #[test]
    fn less_than_one_interval_reports_elapsed_window() {
        assert_eq!(snap_to_next_phase(100, 16, 110), timing(10, 26));
    }

    #[test]
    fn presentation_in_the_future_is_clamped_to_now() {
        assert_eq!(snap_to_next_phase(200, 16, 150), timing(150, 166));
        assert_eq!(snap_to_next_phase(150, 16, 150), timing(150, 166));
    }

    #[test]
    fn zero_interval_does_not_divide() {
        assert_eq!(snap_to_next_phase(10, 0, 50), timing(50, 50));
    }

    #[test]
    fn extreme_inputs_saturate_instead_of_overflowing() {
        assert_eq!(snap_to_next_phase(0, u64::MAX, 1), timing(1, u64::MAX));
        assert_eq!(
            snap_to_next_phase(0, 1, u64::MAX),
            timing(u64::MAX - 1, u64::MAX)
        );
    }
}
