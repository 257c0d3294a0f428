//! Learning rate schedules with linear warmup.

use crate::config::{LrSchedulerKind, TrainingSettings};

/// Warmup followed by a constant, linear, or cosine decay.
///
/// The schedule is a pure function of the step, so the engine can ask for any
/// step without keeping scheduler state in its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    kind: LrSchedulerKind,
    base_lr: f32,
    warmup_steps: usize,
    total_steps: usize,
}

impl LrSchedule {
    /// Create a schedule.
    #[must_use]
    pub fn new(kind: LrSchedulerKind, base_lr: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps: total_steps.max(warmup_steps + 1),
        }
    }

    /// Schedule described by the training settings.
    #[must_use]
    pub fn from_settings(training: &TrainingSettings) -> Self {
        Self::new(
            training.lr_scheduler,
            training.learning_rate,
            training.warmup_steps,
            training.max_steps,
        )
    }

    /// Peak learning rate.
    #[must_use]
    pub fn base_lr(&self) -> f32 {
        self.base_lr
    }

    /// Learning rate at `step`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn lr_at(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            return self.base_lr * (step as f32 / self.warmup_steps as f32);
        }
        let decay_steps = (self.total_steps - self.warmup_steps) as f32;
        let progress = ((step - self.warmup_steps) as f32 / decay_steps).min(1.0);
        match self.kind {
            LrSchedulerKind::Constant => self.base_lr,
            LrSchedulerKind::Linear => self.base_lr * (1.0 - progress).max(0.0),
            LrSchedulerKind::Cosine => {
                let cosine_decay = 0.5 * (1.0 + (std::f32::consts::PI * progress).cos());
                self.base_lr * cosine_decay
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_schedule() {
        let schedule = LrSchedule::new(LrSchedulerKind::Constant, 1e-3, 0, 100);
        assert_eq!(schedule.lr_at(0), 1e-3);
        assert_eq!(schedule.lr_at(10_000), 1e-3);
    }

    #[test]
    fn test_linear_warmup() {
        let schedule = LrSchedule::new(LrSchedulerKind::Linear, 1e-3, 100, 1000);

        // At step 0, should be 0
        assert_eq!(schedule.lr_at(0), 0.0);

        // At step 50, should be half of base_lr
        assert!((schedule.lr_at(50) - 5e-4).abs() < 1e-9);

        // At step 100, should be base_lr
        assert!((schedule.lr_at(100) - 1e-3).abs() < 1e-9);

        // At step 550 (halfway through decay), should be half of base_lr
        assert!((schedule.lr_at(550) - 5e-4).abs() < 1e-8);
    }

    #[test]
    fn test_cosine_schedule() {
        let schedule = LrSchedule::new(LrSchedulerKind::Cosine, 1e-3, 100, 1000);

        assert_eq!(schedule.lr_at(0), 0.0);
        assert!((schedule.lr_at(50) - 5e-4).abs() < 1e-9);
        assert!((schedule.lr_at(100) - 1e-3).abs() < 1e-9);
        assert!((schedule.lr_at(550) - 5e-4).abs() < 1e-8);

        // At end of training, should approach 0
        assert!(schedule.lr_at(1000) < 1e-9);
        // Past the end stays at the endpoint.
        assert!(schedule.lr_at(5000) < 1e-9);
    }

    #[test]
    fn test_from_settings_defaults() {
        let schedule = LrSchedule::from_settings(&TrainingSettings::default());
        assert_eq!(schedule.lr_at(0), 0.0);
        assert!((schedule.lr_at(100) - 1e-4).abs() < 1e-10);
    }
}
