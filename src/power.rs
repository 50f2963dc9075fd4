//! Pulse-delta to power conversion.
//!
//! A meter emits one pulse per fixed energy quantum, so the pulse rate over
//! an interval projects to power: `P(W) = (3600 s / T(s per pulse)) / ppwh`.

use crate::config::{ChannelConfig, DerivedConfig};
use tracing::warn;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Instantaneous power for one channel from two counter readings.
///
/// Zero elapsed time and zero delta both yield 0 W. A counter that went
/// backwards (meter swap, chip reset) also yields 0 W; the caller stores
/// `current` as the new baseline so the next cycle measures normally.
pub fn estimate(previous: u64, current: u64, elapsed_ms: u64, divisor: f64) -> f64 {
    if elapsed_ms == 0 || current == previous {
        return 0.0;
    }
    if current < previous {
        warn!(previous, current, "pulse counter went backwards; reporting 0 W");
        return 0.0;
    }
    let delta = (current - previous) as f64;
    (MS_PER_HOUR / (elapsed_ms as f64 / delta)) / divisor
}

/// Static description of a metered circuit.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub name: String,
    pub address: String,
    pub counter: crate::counter::CounterId,
    pub divisor: f64,
    pub label: String,
}

impl From<&ChannelConfig> for Channel {
    fn from(c: &ChannelConfig) -> Self {
        Self {
            name: c.name.clone(),
            address: c.address.clone(),
            counter: c.counter,
            divisor: c.divisor,
            label: c.label.clone().unwrap_or_else(|| default_label(&c.name)),
        }
    }
}

/// A channel computed from sampled ones, never read from the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Derived {
    pub name: String,
    pub from: String,
    pub subtract: Vec<String>,
    pub label: String,
}

impl From<&DerivedConfig> for Derived {
    fn from(d: &DerivedConfig) -> Self {
        Self {
            name: d.name.clone(),
            from: d.from.clone(),
            subtract: d.subtract.clone(),
            label: d.label.clone().unwrap_or_else(|| default_label(&d.name)),
        }
    }
}

/// "ftx" -> "Ftx:"
fn default_label(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => format!("{}{}:", first.to_uppercase(), chars.as_str()),
        None => String::new(),
    }
}

/// One raw counter reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub count: u64,
    pub tick_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub channel: String,
    pub label: String,
    pub watts: f64,
    pub derived: bool,
}

/// Everything computed in one control-loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleResult {
    pub elapsed_ms: u64,
    pub readings: Vec<Reading>,
}

impl CycleResult {
    pub fn watts(&self, channel: &str) -> Option<f64> {
        self.readings
            .iter()
            .find(|r| r.channel == channel)
            .map(|r| r.watts)
    }
}

/// `from - subtract[0] - subtract[1] - ...`, left to right, never clamped.
///
/// Inputs missing from `sampled` count as 0 W; config validation makes that
/// unreachable for loaded configurations.
pub fn derive(derived: &Derived, sampled: &[Reading]) -> f64 {
    let watts_of = |name: &str| {
        sampled
            .iter()
            .find(|r| r.channel == name)
            .map(|r| r.watts)
            .unwrap_or(0.0)
    };
    derived
        .subtract
        .iter()
        .fold(watts_of(&derived.from), |acc, name| acc - watts_of(name))
}

/// Per-channel power for a cycle given baseline and current samples.
///
/// `previous` and `current` are indexed like `channels`.
pub fn compute_cycle(
    channels: &[Channel],
    derived: &[Derived],
    previous: &[Sample],
    current: &[Sample],
    elapsed_ms: u64,
) -> CycleResult {
    let mut readings: Vec<Reading> = channels
        .iter()
        .zip(previous.iter().zip(current.iter()))
        .map(|(ch, (prev, cur))| Reading {
            channel: ch.name.clone(),
            label: ch.label.clone(),
            watts: estimate(prev.count, cur.count, elapsed_ms, ch.divisor),
            derived: false,
        })
        .collect();

    let derived_readings: Vec<Reading> = derived
        .iter()
        .map(|d| Reading {
            channel: d.name.clone(),
            label: d.label.clone(),
            watts: derive(d, &readings),
            derived: true,
        })
        .collect();
    readings.extend(derived_readings);

    CycleResult {
        elapsed_ms,
        readings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::CounterId;

    fn channel(name: &str, divisor: f64) -> Channel {
        Channel {
            name: name.into(),
            address: "1d-test".into(),
            counter: CounterId::A,
            divisor,
            label: default_label(name),
        }
    }

    fn household() -> Derived {
        Derived {
            name: "household".into(),
            from: "total".into(),
            subtract: vec!["heater".into(), "ftx".into()],
            label: "House:".into(),
        }
    }

    fn samples(counts: &[u64], tick_ms: u64) -> Vec<Sample> {
        counts.iter().map(|&count| Sample { count, tick_ms }).collect()
    }

    #[test]
    fn test_zero_delta_is_zero_power() {
        for divisor in [1.0, 0.8, 2.5] {
            for elapsed in [1, 1_000, 61_999, 86_400_000] {
                assert_eq!(estimate(4_200, 4_200, elapsed, divisor), 0.0);
            }
        }
    }

    #[test]
    fn test_zero_interval_is_zero_power() {
        for divisor in [1.0, 0.8] {
            assert_eq!(estimate(0, 0, 0, divisor), 0.0);
            assert_eq!(estimate(1_000, 1_010, 0, divisor), 0.0);
            assert_eq!(estimate(1_010, 1_000, 0, divisor), 0.0);
        }
    }

    #[test]
    fn test_backwards_counter_clamps_to_zero() {
        assert_eq!(estimate(1_010, 1_000, 1_000, 1.0), 0.0);
        assert_eq!(estimate(u64::from(u32::MAX), 3, 1_000, 1.0), 0.0);
    }

    #[test]
    fn test_monotonic_in_delta() {
        let mut last = 0.0;
        for delta in 1..200u64 {
            let p = estimate(10_000, 10_000 + delta, 54_000, 0.8);
            assert!(p > last, "delta {} gave {} <= {}", delta, p, last);
            last = p;
        }
    }

    #[test]
    fn test_monotonic_decreasing_in_elapsed() {
        let mut last = f64::INFINITY;
        for elapsed in (500..120_000u64).step_by(500) {
            let p = estimate(10_000, 10_017, elapsed, 1.0);
            assert!(p < last, "elapsed {} gave {} >= {}", elapsed, p, last);
            last = p;
        }
    }

    #[test]
    fn test_one_pulse_per_second_is_3600w() {
        assert_eq!(estimate(0, 1, 1_000, 1.0), 3_600.0);
    }

    #[test]
    fn test_reference_cycle() {
        let channels = vec![
            channel("total", 1.0),
            channel("heater", 0.8),
            channel("ftx", 1.0),
        ];
        let prev = samples(&[1_000, 200, 100], 0);
        let cur = samples(&[1_010, 202, 101], 1_000);

        let result = compute_cycle(&channels, &[household()], &prev, &cur, 1_000);

        assert_eq!(result.elapsed_ms, 1_000);
        assert_eq!(result.watts("total"), Some(36_000.0));
        assert_eq!(result.watts("heater"), Some(9_000.0));
        assert_eq!(result.watts("ftx"), Some(3_600.0));
        assert_eq!(result.watts("household"), Some(23_400.0));
        assert!(result.readings[3].derived);
    }

    #[test]
    fn test_household_is_exact_and_may_be_negative() {
        let channels = vec![
            channel("total", 1.0),
            channel("heater", 0.8),
            channel("ftx", 1.0),
        ];
        let prev = samples(&[500, 500, 500], 0);
        let cur = samples(&[501, 503, 502], 7_000);

        let result = compute_cycle(&channels, &[household()], &prev, &cur, 7_000);
        let total = result.watts("total").unwrap();
        let heater = result.watts("heater").unwrap();
        let ftx = result.watts("ftx").unwrap();
        let house = result.watts("household").unwrap();

        assert_eq!(house, total - heater - ftx);
        assert!(house < 0.0);
    }

    #[test]
    fn test_default_label() {
        assert_eq!(default_label("total"), "Total:");
        assert_eq!(default_label(""), "");
    }
}
