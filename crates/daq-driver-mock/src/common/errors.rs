//! Error injection framework for mock acquisition objects.
//!
//! Every capability call of a mock object goes through
//! [`ErrorConfig::apply`] with an operation label (`"prepare"`, `"start"`,
//! `"stop"`, `"read"`, `"move"`). Scenarios decide whether that call is
//! slowed down or fails; failures surface as [`MockFault`] wrapped in
//! `anyhow::Error`, which the engine attaches to the object and phase.

use super::rng::MockRng;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Injected failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MockFault {
    #[error("{device}: injected failure on '{operation}' after {count} successful calls")]
    FailAfterN {
        device: String,
        operation: &'static str,
        count: u32,
    },
    #[error("{device}: operation '{operation}' timed out")]
    Timeout {
        device: String,
        operation: &'static str,
    },
    #[error("{device}: communication lost")]
    CommunicationLost { device: String },
    #[error("{device}: hardware fault {code}")]
    HardwareFault { device: String, code: u32 },
    #[error("{device}: random failure on '{operation}'")]
    Random {
        device: String,
        operation: &'static str,
    },
}

/// Error injection configuration for mock objects
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0), `"*"` matches every operation
    failure_rates: Arc<HashMap<&'static str, f64>>,
    /// Specific failure scenarios
    scenarios: Arc<Vec<ErrorScenario>>,
    /// RNG for failure decisions
    rng: Arc<MockRng>,
    /// State tracking for scenarios
    state: Arc<Mutex<ErrorState>>,
}

#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Fail every call after N successful ones
    FailAfterN {
        operation: &'static str,
        count: u32,
    },
    /// Every call of the operation times out
    Timeout { operation: &'static str },
    /// Every call of the operation takes `delay` before anything else happens
    Delay {
        operation: &'static str,
        delay: Duration,
    },
    /// First call of any operation loses the link; every later call fails
    CommunicationLoss,
    /// Latched hardware fault with a specific code
    HardwareFault { code: u32 },
}

#[derive(Default, Debug)]
struct ErrorState {
    /// Operation counters for FailAfterN scenarios
    operation_counts: HashMap<&'static str, u32>,
    /// Whether communication is lost
    communication_lost: bool,
    /// Hardware fault code (0 = no fault)
    hardware_fault_code: u32,
}

impl ErrorConfig {
    fn build(
        failure_rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(failure_rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// No injected errors.
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Uniform random failures on every operation, reproducible with `seed`.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        Self::build(HashMap::from([("*", rate)]), Vec::new(), seed)
    }

    /// A single scenario.
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios, checked in order.
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Custom failure rates per operation.
    pub fn with_rates(rates: HashMap<&'static str, f64>) -> Self {
        Self::build(rates, Vec::new(), None)
    }

    /// Delay configured for `operation`, summed over matching scenarios.
    pub fn delay_for(&self, operation: &str) -> Duration {
        self.scenarios
            .iter()
            .filter_map(|s| match s {
                ErrorScenario::Delay { operation: op, delay } if *op == operation => Some(*delay),
                _ => None,
            })
            .sum()
    }

    /// Sleep for any configured delay, then check for an injected failure.
    pub async fn apply(&self, device: &str, operation: &'static str) -> anyhow::Result<()> {
        let delay = self.delay_for(operation);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_operation(device, operation)?;
        Ok(())
    }

    /// Check if an operation should fail and return the matching fault.
    pub fn check_operation(&self, device: &str, operation: &'static str) -> Result<(), MockFault> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(MockFault::CommunicationLost {
                device: device.to_string(),
            });
        }

        if state.hardware_fault_code != 0 {
            return Err(MockFault::HardwareFault {
                device: device.to_string(),
                code: state.hardware_fault_code,
            });
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation => {
                    let current = state.operation_counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(MockFault::FailAfterN {
                            device: device.to_string(),
                            operation,
                            count: *count,
                        });
                    }
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(MockFault::Timeout {
                        device: device.to_string(),
                        operation,
                    });
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(MockFault::CommunicationLost {
                        device: device.to_string(),
                    });
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = *code;
                    return Err(MockFault::HardwareFault {
                        device: device.to_string(),
                        code: *code,
                    });
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);

        if self.rng.chance(rate) {
            return Err(MockFault::Random {
                device: device.to_string(),
                operation,
            });
        }

        Ok(())
    }

    /// Reset error state (clear counters, faults)
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
