//! Prediction of low-order derivative discontinuities.
//!
//! A jump in the derivative at the start of integration propagates to
//! `t_start + n_1 tau_1 + n_2 tau_2 + ...`. Steps that straddle these times
//! break the smoothness the error estimate relies on, so the scheduler lets
//! the controller land on them instead.

/// Sorted discontinuity times ahead of the integration.
#[derive(Debug, Clone)]
pub struct DiscontinuityScheduler {
    times: Vec<f64>,
    next: usize,
}

impl DiscontinuityScheduler {
    /// Predicts discontinuities from `start` for all non-negative integer
    /// combinations of `delays` with total multiplicity `1..=order`. Times
    /// closer than `min_distance` are merged.
    pub fn new(start: f64, delays: &[f64], order: usize, min_distance: f64) -> Self {
        let mut delays: Vec<f64> = delays.iter().copied().filter(|d| *d > 0.0).collect();
        delays.sort_by(|a, b| a.total_cmp(b));
        delays.dedup_by(|a, b| (*a - *b).abs() <= min_distance);

        let mut offsets: Vec<f64> = Vec::new();
        let mut level = vec![0.0];
        for _ in 0..order {
            let mut next_level: Vec<f64> = level
                .iter()
                .flat_map(|base| delays.iter().map(move |d| base + d))
                .collect();
            merge_close(&mut next_level, min_distance);
            offsets.extend_from_slice(&next_level);
            level = next_level;
        }
        merge_close(&mut offsets, min_distance);

        Self {
            times: offsets.into_iter().map(|offset| start + offset).collect(),
            next: 0,
        }
    }

    /// All predicted times, including those already passed.
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn upcoming(&self) -> Option<f64> {
        self.times.get(self.next).copied()
    }

    pub fn is_exhausted(&self) -> bool {
        self.next >= self.times.len()
    }

    /// Shortens `step` from `t` so the step ends on the next discontinuity if
    /// one lies within it. Discontinuities closer to `t` than `min_step` are
    /// treated as passed, and so are all times up to `t`, which keeps the
    /// scheduler valid after the history is truncated. Returns the step to
    /// attempt and whether it was clamped.
    pub fn clamp(&mut self, t: f64, step: f64, min_step: f64) -> (f64, bool) {
        self.next = self.times.partition_point(|time| *time <= t + min_step);
        match self.upcoming() {
            Some(time) if time <= t + step => (time - t, true),
            _ => (step, false),
        }
    }
}

fn merge_close(values: &mut Vec<f64>, min_distance: f64) {
    values.sort_by(|a, b| a.total_cmp(b));
    values.dedup_by(|later, earlier| *later - *earlier <= min_distance);
}

#[cfg(test)]
mod tests {
    use super::DiscontinuityScheduler;
    use approx::assert_abs_diff_eq;

    #[test]
    fn generates_integer_combinations_of_delays() {
        let scheduler = DiscontinuityScheduler::new(0.0, &[1.0, 1.5], 2, 1e-9);
        let expected = [1.0, 1.5, 2.0, 2.5, 3.0];
        assert_eq!(scheduler.times().len(), expected.len());
        for (time, want) in scheduler.times().iter().zip(expected) {
            assert_abs_diff_eq!(*time, want, epsilon = 1e-12);
        }
    }

    #[test]
    fn merges_nearby_times_and_ignores_zero_delays() {
        let scheduler = DiscontinuityScheduler::new(10.0, &[0.0, 1.0, 1.0 + 1e-7], 1, 1e-5);
        assert_eq!(scheduler.times(), &[11.0]);
    }

    #[test]
    fn clamps_steps_onto_discontinuities() {
        let mut scheduler = DiscontinuityScheduler::new(0.0, &[1.0], 3, 1e-9);

        assert_eq!(scheduler.clamp(0.0, 0.5, 1e-10), (0.5, false));

        let (step, clamped) = scheduler.clamp(0.5, 2.0, 1e-10);
        assert!(clamped);
        assert_abs_diff_eq!(step, 0.5, epsilon = 1e-12);

        // Landed on t = 1; the next one is t = 2.
        let (step, clamped) = scheduler.clamp(1.0, 5.0, 1e-10);
        assert!(clamped);
        assert_abs_diff_eq!(step, 1.0, epsilon = 1e-12);

        let (_, clamped) = scheduler.clamp(3.0, 5.0, 1e-10);
        assert!(!clamped);
        assert!(scheduler.is_exhausted());

        // Going back in time revives the discontinuities ahead.
        let (step, clamped) = scheduler.clamp(1.5, 5.0, 1e-10);
        assert!(clamped);
        assert_abs_diff_eq!(step, 0.5, epsilon = 1e-12);
    }
}
