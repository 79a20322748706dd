use crate::{MlErr, Result};

/// Staircase exponential decay of the learning rate:
/// `base * decay ^ floor(step * batch_size / decay_examples)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialDecay {
    base: f32,
    decay: f32,
    decay_examples: u64,
    batch_size: u64,
}

impl ExponentialDecay {
    /// Creates a new `ExponentialDecay`.
    ///
    /// # Arguments
    /// * `base` - The learning rate at step 0.
    /// * `decay` - The factor applied on every interval.
    /// * `decay_examples` - The amount of examples in an interval.
    /// * `batch_size` - The amount of examples per step.
    ///
    /// # Returns
    /// The schedule or an error if the interval or the batch size is zero.
    pub fn new(base: f32, decay: f32, decay_examples: u64, batch_size: u64) -> Result<Self> {
        if decay_examples == 0 {
            return Err(MlErr::InvalidHyperParameter {
                name: "learning_rate_decay_examples",
                reason: "must be positive".into(),
            });
        }

        if batch_size == 0 {
            return Err(MlErr::InvalidHyperParameter {
                name: "batch_size",
                reason: "must be positive".into(),
            });
        }

        Ok(Self {
            base,
            decay,
            decay_examples,
            batch_size,
        })
    }

    /// Returns the learning rate at `step`.
    pub fn rate(&self, step: u64) -> f32 {
        let intervals = step.saturating_mul(self.batch_size) / self.decay_examples;
        (self.base as f64 * (self.decay as f64).powf(intervals as f64)) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_constant_inside_an_interval() {
        let schedule = ExponentialDecay::new(0.1, 0.5, 100, 10).unwrap();

        assert_eq!(schedule.rate(0), 0.1);
        assert_eq!(schedule.rate(9), 0.1);
        assert_eq!(schedule.rate(10), 0.05);
        assert_eq!(schedule.rate(19), 0.05);
        assert_eq!(schedule.rate(20), 0.025);
    }

    #[test]
    fn rate_matches_the_closed_form() {
        let schedule = ExponentialDecay::new(0.001, 0.95, 4_000_000, 1024).unwrap();

        for step in [0, 1, 3906, 3907, 10_000, 123_456] {
            let expected = 0.001 * 0.95f64.powf(((step * 1024) / 4_000_000) as f64);
            assert!((schedule.rate(step) as f64 - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(ExponentialDecay::new(0.1, 0.5, 0, 10).is_err());
    }
}
