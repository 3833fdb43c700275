//! Mock motor axis.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use daq_core::Positioner;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

use crate::common::ErrorConfig;

/// Limit behavior when a target exceeds the travel range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitBehavior {
    /// Reject the move
    HardStop,
    /// Move to the nearest boundary
    Clamp,
}

/// Axis travel range in dial units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisLimits {
    pub low: f64,
    pub high: f64,
    pub behavior: LimitBehavior,
}

impl AxisLimits {
    /// Limits that reject out-of-range moves.
    pub fn hard_stop(low: f64, high: f64) -> Self {
        Self {
            low,
            high,
            behavior: LimitBehavior::HardStop,
        }
    }

    /// Limits that clamp out-of-range moves.
    pub fn clamp(low: f64, high: f64) -> Self {
        Self {
            low,
            high,
            behavior: LimitBehavior::Clamp,
        }
    }

    fn enforce(&self, target: f64) -> Result<f64> {
        match self.behavior {
            LimitBehavior::Clamp => Ok(target.clamp(self.low, self.high)),
            LimitBehavior::HardStop if target < self.low || target > self.high => Err(anyhow!(
                "target {:.4} exceeds limits [{:.4}, {:.4}]",
                target,
                self.low,
                self.high
            )),
            LimitBehavior::HardStop => Ok(target),
        }
    }
}

#[derive(Debug, Default)]
struct AxisState {
    /// Dial position
    dial: f64,
    moving: bool,
}

/// Simulated motor.
///
/// User position is `dial + offset`. Moves take `distance / speed` seconds
/// when a speed is set and are instantaneous otherwise.
///
/// ```rust,ignore
/// let axis = MockAxis::new("sy").with_speed(5.0).with_limits(AxisLimits::clamp(-1.0, 1.0));
/// axis.move_to(0.5).await?;
/// assert_eq!(axis.position().await?, 0.5);
/// ```
#[derive(Debug)]
pub struct MockAxis {
    name: String,
    state: Mutex<AxisState>,
    offset: f64,
    speed: Option<f64>,
    limits: Option<AxisLimits>,
    errors: ErrorConfig,
}

impl MockAxis {
    /// Axis at dial 0 with instantaneous moves.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(AxisState::default()),
            offset: 0.0,
            speed: None,
            limits: None,
            errors: ErrorConfig::none(),
        }
    }

    /// Start at this dial position.
    pub fn with_dial(self, dial: f64) -> Self {
        self.state.lock().dial = dial;
        self
    }

    /// User/dial offset.
    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    /// Speed in units per second.
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = (speed > 0.0).then_some(speed);
        self
    }

    /// Travel range.
    pub fn with_limits(mut self, limits: AxisLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Error injection on `"move"`.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Move to a user position and wait for the end of motion.
    pub async fn move_to(&self, target: f64) -> Result<()> {
        self.errors.apply(&self.name, "move").await?;

        let mut dial_target = target - self.offset;
        if let Some(limits) = &self.limits {
            dial_target = limits.enforce(dial_target)?;
        }

        let distance = {
            let mut state = self.state.lock();
            state.moving = true;
            (dial_target - state.dial).abs()
        };
        tracing::debug!(axis = %self.name, target, distance, "moving");

        if let Some(speed) = self.speed {
            sleep(Duration::try_from_secs_f64(distance / speed).unwrap_or_default()).await;
        }

        let mut state = self.state.lock();
        state.dial = dial_target;
        state.moving = false;
        Ok(())
    }

    /// Whether a move is in progress.
    pub fn is_moving(&self) -> bool {
        self.state.lock().moving
    }

    fn dial(&self) -> f64 {
        self.state.lock().dial
    }
}

#[async_trait]
impl Positioner for MockAxis {
    fn name(&self) -> &str {
        &self.name
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.dial() + self.offset)
    }

    async fn dial_position(&self) -> Result<f64> {
        Ok(self.dial())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorScenario;

    #[tokio::test]
    async fn test_offset_and_dial() {
        let axis = MockAxis::new("sy").with_offset(2.0);
        axis.move_to(5.0).await.unwrap();
        assert_eq!(axis.position().await.unwrap(), 5.0);
        assert_eq!(axis.dial_position().await.unwrap(), 3.0);
    }

    #[tokio::test]
    async fn test_limits() {
        let axis = MockAxis::new("sz").with_limits(AxisLimits::clamp(-1.0, 1.0));
        axis.move_to(4.0).await.unwrap();
        assert_eq!(axis.position().await.unwrap(), 1.0);

        let axis = MockAxis::new("sz").with_limits(AxisLimits::hard_stop(-1.0, 1.0));
        assert!(axis.move_to(4.0).await.is_err());
        assert_eq!(axis.position().await.unwrap(), 0.0);
        assert!(!axis.is_moving());
    }

    #[tokio::test(start_paused = true)]
    async fn test_motion_time() {
        let axis = MockAxis::new("sx").with_speed(10.0);
        let started = tokio::time::Instant::now();
        axis.move_to(5.0).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_move_error_injection() {
        let axis = MockAxis::new("sx").with_errors(ErrorConfig::scenario(ErrorScenario::Timeout {
            operation: "move",
        }));
        let err = axis.move_to(1.0).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
