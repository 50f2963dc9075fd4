use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use upower_meter::clock::{SystemClock, TokioDelay};
use upower_meter::counter::W1Counters;
use upower_meter::discovery::Topics;
use upower_meter::mqtt::MqttBroker;
use upower_meter::net::TcpProbe;
use upower_meter::status::PanelSink;
use upower_meter::supervisor::ConnectivitySupervisor;
use upower_meter::{Collaborators, Config, ControlLoop};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    info!(
        channels = cfg.channels.len(),
        derived = cfg.derived.len(),
        broker = %format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        "loaded config"
    );

    let supervisor = ConnectivitySupervisor::new(
        Box::new(TcpProbe::new(&cfg.mqtt.host, cfg.mqtt.port, &cfg.network)),
        Box::new(MqttBroker::new(&cfg.mqtt)),
        Topics::new(&cfg.mqtt, &cfg.device),
    );
    let parts = Collaborators {
        counters: Box::new(W1Counters::new(&cfg.bus.w1_root, cfg.bus.family.clone())),
        clock: Box::new(SystemClock::new()),
        delay: Box::new(TokioDelay),
        status: Box::new(PanelSink::new(cfg.status.path.as_ref().map(PathBuf::from))),
        supervisor,
    };

    let control = ControlLoop::new(&cfg, parts);
    match control.run_forever().await {}
}
