//! Declarative mock hardware.
//!
//! A TOML document lists axes, counters and detectors:
//!
//! ```toml
//! [[axis]]
//! name = "sy"
//! speed = 5.0
//!
//! [[counter]]
//! name = "diode"
//! base = 100.0
//! noise = 2.0
//! counting = true
//! unit = "cts"
//!
//! [[detector]]
//! name = "mca"
//! kind = "spectrum"
//! len = 128
//! ```

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::axis::{AxisLimits, MockAxis};
use crate::counter::MockCounter;
use crate::detector::{Frame, MockDetector};

/// Configuration for one [`MockAxis`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    pub name: String,
    /// Initial dial position (default: 0.0)
    #[serde(default)]
    pub dial: f64,
    /// User/dial offset (default: 0.0)
    #[serde(default)]
    pub offset: f64,
    /// Units per second; 0 moves instantly
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub limits: Option<AxisLimits>,
}

/// Configuration for one [`MockCounter`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterConfig {
    pub name: String,
    /// Mean reading (default: 100.0)
    #[serde(default = "default_base")]
    pub base: f64,
    /// Uniform noise amplitude (default: 0.0)
    #[serde(default)]
    pub noise: f64,
    /// Spread readings like photon counts around `base`
    #[serde(default)]
    pub counting: bool,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub unit: Option<String>,
    /// Integration time per point in seconds (default: 0.0)
    #[serde(default)]
    pub count_time: f64,
}

/// Configuration for one [`MockDetector`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub name: String,
    #[serde(flatten)]
    pub frame: Frame,
    /// Readout time per frame in milliseconds (default: 0)
    #[serde(default)]
    pub readout_ms: u64,
}

fn default_base() -> f64 {
    100.0
}

/// Mock hardware description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    #[serde(default)]
    pub axis: Vec<AxisConfig>,
    #[serde(default)]
    pub counter: Vec<CounterConfig>,
    #[serde(default)]
    pub detector: Vec<DetectorConfig>,
}

impl HardwareConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: HardwareConfig =
            toml::from_str(text).context("invalid mock hardware description")?;
        config.validate()?;
        Ok(config)
    }

    /// One axis `sy`, counters `diode` and `mon`, spectrum detector `mca`.
    pub fn demo() -> Self {
        let counter = |name: &str, base: f64, seed: u64| CounterConfig {
            name: name.to_string(),
            base,
            noise: base * 0.02,
            counting: false,
            seed,
            unit: Some("cts".to_string()),
            count_time: 0.0,
        };
        Self {
            axis: vec![AxisConfig {
                name: "sy".to_string(),
                dial: 0.0,
                offset: 0.0,
                speed: 0.0,
                limits: None,
            }],
            counter: vec![
                CounterConfig {
                    counting: true,
                    ..counter("diode", 1000.0, 1)
                },
                counter("mon", 250.0, 2),
            ],
            detector: vec![DetectorConfig {
                name: "mca".to_string(),
                frame: Frame::Spectrum { len: 128 },
                readout_ms: 0,
            }],
        }
    }

    /// Names must be unique across all objects.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let names = self
            .axis
            .iter()
            .map(|a| &a.name)
            .chain(self.counter.iter().map(|c| &c.name))
            .chain(self.detector.iter().map(|d| &d.name));
        for name in names {
            if name.trim().is_empty() {
                bail!("mock object with empty name");
            }
            if !seen.insert(name) {
                bail!("duplicate mock object name '{}'", name);
            }
        }
        if let Some(c) = self.counter.iter().find(|c| c.count_time < 0.0 || c.count_time.is_nan()) {
            bail!("counter '{}': count_time must not be negative", c.name);
        }
        for axis in &self.axis {
            if axis.speed < 0.0 {
                bail!("axis '{}': speed must not be negative", axis.name);
            }
        }
        Ok(())
    }

    /// Apply one integration time to every counter and detector readout.
    pub fn set_count_time(&mut self, count_time: Duration) {
        for counter in &mut self.counter {
            counter.count_time = count_time.as_secs_f64();
        }
        for detector in &mut self.detector {
            detector.readout_ms = count_time.as_millis() as u64;
        }
    }

    /// Instantiate every described object.
    pub fn build(&self) -> MockHardware {
        let axes = self
            .axis
            .iter()
            .map(|cfg| {
                let mut axis = MockAxis::new(&cfg.name)
                    .with_dial(cfg.dial)
                    .with_offset(cfg.offset)
                    .with_speed(cfg.speed);
                if let Some(limits) = cfg.limits {
                    axis = axis.with_limits(limits);
                }
                Arc::new(axis)
            })
            .collect();
        let counters = self
            .counter
            .iter()
            .map(|cfg| {
                let mut counter = MockCounter::new(&cfg.name)
                    .with_signal(cfg.base, cfg.noise)
                    .with_seed(cfg.seed)
                    .with_count_time(
                        Duration::try_from_secs_f64(cfg.count_time).unwrap_or_default(),
                    );
                if cfg.counting {
                    counter = counter.with_counting_statistics();
                }
                if let Some(unit) = &cfg.unit {
                    counter = counter.with_unit(unit.clone());
                }
                Arc::new(counter)
            })
            .collect();
        let detectors = self
            .detector
            .iter()
            .map(|cfg| {
                Arc::new(
                    MockDetector::new(&cfg.name, cfg.frame)
                        .with_readout(Duration::from_millis(cfg.readout_ms)),
                )
            })
            .collect();
        MockHardware {
            axes,
            counters,
            detectors,
        }
    }
}

/// Objects built from a [`HardwareConfig`].
#[derive(Default)]
pub struct MockHardware {
    pub axes: Vec<Arc<MockAxis>>,
    pub counters: Vec<Arc<MockCounter>>,
    pub detectors: Vec<Arc<MockDetector>>,
}

impl MockHardware {
    pub fn axis(&self, name: &str) -> Result<Arc<MockAxis>> {
        self.axes
            .iter()
            .find(|a| daq_core::Positioner::name(a.as_ref()) == name)
            .cloned()
            .ok_or_else(|| anyhow!("no mock axis named '{}'", name))
    }

    pub fn counter(&self, name: &str) -> Result<Arc<MockCounter>> {
        self.counters
            .iter()
            .find(|c| daq_core::AcquisitionObject::name(c.as_ref()) == name)
            .cloned()
            .ok_or_else(|| anyhow!("no mock counter named '{}'", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_build() {
        let config = HardwareConfig::from_toml(
            r#"
            [[axis]]
            name = "sy"
            speed = 5.0
            limits = { low = -1.0, high = 1.0, behavior = "clamp" }

            [[counter]]
            name = "diode"
            unit = "cts"

            [[detector]]
            name = "cam"
            kind = "image"
            width = 16
            height = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.counter[0].base, 100.0);
        assert_eq!(
            config.detector[0].frame,
            Frame::Image {
                width: 16,
                height: 8
            }
        );

        let hw = config.build();
        assert!(hw.axis("sy").is_ok());
        assert!(hw.counter("diode").is_ok());
        assert!(hw.counter("sy").is_err());
        assert_eq!(hw.detectors.len(), 1);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = HardwareConfig::from_toml(
            r#"
            [[axis]]
            name = "x"
            [[counter]]
            name = "x"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_demo_is_valid() {
        let demo = HardwareConfig::demo();
        assert!(demo.validate().is_ok());
        assert_eq!(demo.build().counters.len(), 2);
    }
}
