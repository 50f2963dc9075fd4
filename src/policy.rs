//! Freshness and escalation policy for each cycle's readings.

use crate::config::TimingConfig;
use std::fmt;

/// Reason the process gave up. Terminal: only a restart clears it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    NetworkSetup(String),
    BrokerSetup(String),
    NoCounters,
    Bus(String),
    StaleBudgetExhausted { stale_cycles: u32 },
}

impl Fault {
    /// Short text for the status line (fits the 16 column panel).
    pub fn short_reason(&self) -> &'static str {
        match self {
            Fault::NetworkSetup(_) => "NETWORK",
            Fault::BrokerSetup(_) => "MQTT",
            Fault::NoCounters => "NO COUNTERS",
            Fault::Bus(_) => "BUS",
            Fault::StaleBudgetExhausted { .. } => "STALE",
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::NetworkSetup(e) => write!(f, "network setup failed: {}", e),
            Fault::BrokerSetup(e) => write!(f, "broker setup failed: {}", e),
            Fault::NoCounters => write!(f, "no counter devices found on the bus"),
            Fault::Bus(e) => write!(f, "counter bus failure: {}", e),
            Fault::StaleBudgetExhausted { stale_cycles } => {
                write!(f, "{} stale intervals, giving up", stale_cycles)
            }
        }
    }
}

/// Process-wide health, owned by the control loop for the run's lifetime.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthState {
    stale_cycles: u32,
    publish_failures: u32,
    fault: Option<Fault>,
}

impl HealthState {
    pub fn stale_cycles(&self) -> u32 {
        self.stale_cycles
    }

    pub fn publish_failures(&self) -> u32 {
        self.publish_failures
    }

    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    /// First fault wins; later ones are ignored.
    pub fn trip(&mut self, fault: Fault) {
        if self.fault.is_none() {
            self.fault = Some(fault);
        }
    }

    /// Publish failures are counted for visibility only; they never escalate.
    pub fn record_publish_failure(&mut self) {
        self.publish_failures = self.publish_failures.saturating_add(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// First cycle after setup: display only.
    Prime,
    Publish,
    SkipStale { stale_cycles: u32 },
    SkipFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    /// A full day went by; the wall clock should be resynced.
    pub resync: bool,
}

#[derive(Debug, Clone)]
pub struct ReportingPolicy {
    stale_threshold_ms: u64,
    stale_budget: u32,
    resync_after_ms: u64,
    primed: bool,
    health: HealthState,
}

impl ReportingPolicy {
    pub fn new(timing: &TimingConfig) -> Self {
        Self {
            stale_threshold_ms: timing.stale_threshold_ms,
            stale_budget: timing.stale_budget,
            resync_after_ms: timing.resync_after_ms,
            primed: false,
            health: HealthState::default(),
        }
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    pub fn health_mut(&mut self) -> &mut HealthState {
        &mut self.health
    }

    /// Decide what to do with a cycle that spanned `elapsed_ms`.
    ///
    /// The stale counter only ever grows: the budget is spent across the whole
    /// process lifetime, fresh cycles in between do not refund it.
    pub fn evaluate(&mut self, elapsed_ms: u64) -> Verdict {
        if self.health.is_faulted() {
            return Verdict {
                decision: Decision::SkipFault,
                resync: false,
            };
        }

        if !self.primed {
            self.primed = true;
            return Verdict {
                decision: Decision::Prime,
                resync: false,
            };
        }

        let resync = elapsed_ms >= self.resync_after_ms;

        if elapsed_ms < self.stale_threshold_ms {
            return Verdict {
                decision: Decision::Publish,
                resync,
            };
        }

        self.health.stale_cycles += 1;
        let stale_cycles = self.health.stale_cycles;
        if stale_cycles >= self.stale_budget {
            self.health.trip(Fault::StaleBudgetExhausted { stale_cycles });
            return Verdict {
                decision: Decision::SkipFault,
                resync,
            };
        }

        Verdict {
            decision: Decision::SkipStale { stale_cycles },
            resync,
        }
    }
}
