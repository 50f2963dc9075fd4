//! The metering control loop.
//!
//! `Initializing -> Priming -> Steady -> Faulted`. Each cycle runs to
//! completion before the next starts; all per-cycle state (last counts,
//! health) lives in [`ControlLoop`] and nowhere else.

use crate::clock::{Clock, Delay, TimeSource};
use crate::config::{Config, TimingConfig};
use crate::counter::CounterSource;
use crate::error::{BusError, CycleError};
use crate::policy::{Decision, Fault, HealthState, ReportingPolicy};
use crate::power::{compute_cycle, Channel, CycleResult, Derived, Sample};
use crate::restart;
use crate::status::{Row, StatusSink};
use crate::supervisor::{ConnectivitySupervisor, Published};
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const HEADER: &str = "  Power usage";

/// External collaborators handed to the loop at construction.
pub struct Collaborators {
    pub counters: Box<dyn CounterSource>,
    pub clock: Box<dyn Clock>,
    pub delay: Box<dyn Delay>,
    pub status: Box<dyn StatusSink>,
    pub supervisor: ConnectivitySupervisor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Priming,
    Steady,
    Faulted(Fault),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Primed,
    Published(Published),
    SkippedStale { stale_cycles: u32 },
    Faulted(Fault),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub result: CycleResult,
    pub report: Report,
    pub resynced: bool,
}

pub struct ControlLoop {
    channels: Vec<Channel>,
    derived: Vec<Derived>,
    timing: TimingConfig,
    policy: ReportingPolicy,
    state: LoopState,
    /// Exactly one per channel, same order as `channels`.
    last: Vec<Sample>,
    counters: Box<dyn CounterSource>,
    clock: Box<dyn Clock>,
    delay: Box<dyn Delay>,
    status: Box<dyn StatusSink>,
    supervisor: ConnectivitySupervisor,
}

impl ControlLoop {
    pub fn new(cfg: &Config, parts: Collaborators) -> Self {
        Self {
            channels: cfg.channels.iter().map(Channel::from).collect(),
            derived: cfg.derived.iter().map(Derived::from).collect(),
            timing: cfg.timing.clone(),
            policy: ReportingPolicy::new(&cfg.timing),
            state: LoopState::Initializing,
            last: Vec::new(),
            counters: parts.counters,
            clock: parts.clock,
            delay: parts.delay,
            status: parts.status,
            supervisor: parts.supervisor,
        }
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn health(&self) -> &HealthState {
        self.policy.health()
    }

    pub fn last_samples(&self) -> &[Sample] {
        &self.last
    }

    /// Bring up network, broker and bus, then take the baseline counts.
    pub async fn initialize(&mut self) -> Result<(), Fault> {
        self.state = LoopState::Initializing;
        match self.setup().await {
            Ok(()) => {
                self.state = LoopState::Priming;
                Ok(())
            }
            Err(fault) => {
                self.enter_fault(fault.clone());
                Err(fault)
            }
        }
    }

    async fn setup(&mut self) -> Result<(), Fault> {
        self.status.header("  Setting up..");

        self.status.render("Connecting net", "", Row::line(1));
        let addr = self
            .supervisor
            .bring_up_network()
            .await
            .map_err(|e| Fault::NetworkSetup(e.to_string()))?;
        self.status.render("", &addr, Row::line(2));

        self.status.render("MQTT", "", Row::line(3));
        let names = self
            .channels
            .iter()
            .map(|c| c.name.as_str())
            .chain(self.derived.iter().map(|d| d.name.as_str()));
        let session = match self.supervisor.open_session().await {
            Ok(()) => self.supervisor.announce(names).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = session {
            error!(error = %e, "MQTT setup failed");
            self.status.render("MQTT", "ERROR", Row::line(3));
            return Err(Fault::BrokerSetup(e.to_string()));
        }
        self.status.render("MQTT", "OK", Row::line(3));

        let found = self
            .counters
            .scan()
            .await
            .map_err(|e| Fault::Bus(e.to_string()))?;
        info!(counters = found, "counters on bus");
        self.status.render("Counters:", &found.to_string(), Row::line(4));
        if found == 0 {
            return Err(Fault::NoCounters);
        }

        self.resync().await;
        self.status.render("Setup complete", "", Row::STATUS);
        self.pause(self.timing.setup_pause_ms).await;

        self.last = self
            .sample()
            .await
            .map_err(|e| Fault::Bus(e.to_string()))?;
        self.status.header(HEADER);
        info!(channels = self.channels.len(), "baseline counts taken");
        Ok(())
    }

    async fn sample(&mut self) -> Result<Vec<Sample>, BusError> {
        let mut counts = Vec::with_capacity(self.channels.len());
        for ch in &self.channels {
            counts.push(self.counters.read(&ch.address, ch.counter).await?);
        }
        let tick_ms = self.clock.now_ms();
        Ok(counts
            .into_iter()
            .map(|count| Sample { count, tick_ms })
            .collect())
    }

    fn last_tick(&self) -> u64 {
        self.last.first().map(|s| s.tick_ms).unwrap_or(0)
    }

    /// One sampling cycle: read, compute, display, decide, publish.
    ///
    /// A bus error leaves the last counts and tick untouched so the next
    /// successful cycle spans the gap.
    pub async fn cycle(&mut self) -> Result<CycleOutcome, CycleError> {
        let current = match self.sample().await {
            Ok(samples) => samples,
            Err(e) => {
                warn!(error = %e, "counter read failed; skipping cycle");
                self.status.render("Bus", "ERROR", Row::STATUS);
                return Err(e.into());
            }
        };

        let tick = current.first().map(|s| s.tick_ms).unwrap_or(0);
        let elapsed_ms = tick.saturating_sub(self.last_tick());
        let result = compute_cycle(
            &self.channels,
            &self.derived,
            &self.last,
            &current,
            elapsed_ms,
        );
        self.last = current;

        for r in &result.readings {
            debug!(channel = %r.channel, watts = r.watts, "reading");
        }
        info!(interval_s = elapsed_ms as f64 / 1000.0, "cycle sampled");
        self.show(&result);

        let verdict = self.policy.evaluate(elapsed_ms);
        let report = match verdict.decision {
            Decision::Prime => {
                self.state = LoopState::Steady;
                info!("priming cycle complete; publishing from next cycle");
                Report::Primed
            }
            Decision::Publish => match self.supervisor.publish_cycle(&result.readings).await {
                Ok(published) => {
                    info!(
                        messages = published.messages,
                        attempts = published.attempts,
                        "published readings"
                    );
                    self.status.render("", "Publish!", Row::STATUS);
                    self.pause(self.timing.publish_pause_ms).await;
                    Report::Published(published)
                }
                Err(e) => {
                    self.policy.health_mut().record_publish_failure();
                    error!(
                        error = %e,
                        failures = self.policy.health().publish_failures(),
                        "publish failed after retry"
                    );
                    self.status.render("Publish", "FAILED", Row::STATUS);
                    return Err(e.into());
                }
            },
            Decision::SkipStale { stale_cycles } => {
                warn!(
                    interval_s = elapsed_ms as f64 / 1000.0,
                    stale_cycles,
                    budget = self.timing.stale_budget,
                    "will not publish stale readings"
                );
                self.status.render(
                    "Stale",
                    &format!("{}/{}", stale_cycles, self.timing.stale_budget),
                    Row::STATUS,
                );
                Report::SkippedStale { stale_cycles }
            }
            Decision::SkipFault => {
                let fault = self.policy.health().fault().cloned().unwrap_or(
                    Fault::StaleBudgetExhausted {
                        stale_cycles: self.policy.health().stale_cycles(),
                    },
                );
                self.enter_fault(fault.clone());
                Report::Faulted(fault)
            }
        };

        let resynced = verdict.resync && self.resync().await;
        Ok(CycleOutcome {
            result,
            report,
            resynced,
        })
    }

    fn show(&mut self, result: &CycleResult) {
        for (i, r) in result.readings.iter().enumerate() {
            self.status
                .render(&r.label, &format!("{}W", r.watts as i64), Row::reading(i));
        }
    }

    async fn resync(&mut self) -> bool {
        match self.clock.resync(TimeSource::NetworkTime).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "clock resync failed");
                false
            }
        }
    }

    async fn pause(&mut self, ms: u64) {
        if ms > 0 {
            self.delay.sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Wait out the rest of the cycle, blinking the status line.
    pub async fn pace(&mut self) {
        for _ in 0..self.timing.pace_ticks {
            self.status.render("", "_", Row::STATUS);
            self.pause(self.timing.pace_tick_ms).await;
            self.status.render("", "", Row::STATUS);
            self.pause(self.timing.pace_tick_ms).await;
        }
    }

    fn enter_fault(&mut self, fault: Fault) {
        self.policy.health_mut().trip(fault.clone());
        self.state = LoopState::Faulted(fault);
    }

    /// Show the fault and count down to the restart.
    async fn surface(&mut self, fault: Fault) -> Fault {
        error!(%fault, "entering fault state");
        self.status.header("    !!ERROR!!");
        self.status.render("", fault.short_reason(), Row::line(2));
        self.status.render("ERROR!", "REBOOTING", Row::STATUS);
        self.pause(self.timing.fault_notice_ms).await;

        self.status.clear();
        self.status.render(" REBOOTING IN", "", Row::line(2));
        for i in (1..=self.timing.restart_countdown).rev() {
            self.status
                .render(&format!("       {}", i), "", Row::line(4));
            self.pause(1_000).await;
        }
        self.status.clear();
        fault
    }

    /// Drive the state machine until it faults; returns after the restart
    /// countdown has been shown.
    pub async fn run(mut self) -> Fault {
        if let Err(fault) = self.initialize().await {
            return self.surface(fault).await;
        }

        loop {
            match self.cycle().await {
                Ok(CycleOutcome {
                    report: Report::Faulted(fault),
                    ..
                }) => return self.surface(fault).await,
                Ok(_) => {}
                Err(e) => error!(error = %e, "cycle failed"),
            }
            self.pace().await;
        }
    }

    /// [`run`](Self::run), then restart the process. Never returns.
    pub async fn run_forever(self) -> Infallible {
        let fault = self.run().await;
        restart::restart_process(&fault)
    }
}
