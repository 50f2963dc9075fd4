use crate::config::MqttConfig;
use crate::error::BrokerError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Delivery guarantees used by this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

pub fn qos(q: Qos) -> QoS {
    match q {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send {
    /// Open a fresh session, dropping any previous one.
    async fn connect(&mut self) -> Result<(), BrokerError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        retain: bool,
        qos: Qos,
    ) -> Result<(), BrokerError>;
}

pub fn build_options(cfg: &MqttConfig) -> MqttOptions {
    let client_id = cfg
        .client_id
        .clone()
        .unwrap_or_else(|| format!("upower-meter-{}", Uuid::new_v4()));
    let mut opts = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.unwrap_or(30)));
    opts.set_clean_session(true);
    if let (Some(u), Some(p)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    opts
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Link {
    Connecting,
    Up,
    Down(String),
}

struct Session {
    client: AsyncClient,
    link: watch::Receiver<Link>,
    poller: JoinHandle<()>,
}

/// MQTT 3.1.1 session on rumqttc.
///
/// The event loop is polled by a background task that stops on the first
/// connection error; rumqttc's own reconnect-on-poll is not used so the
/// connectivity supervisor stays the only place that decides to reconnect.
pub struct MqttBroker {
    options: MqttOptions,
    connect_timeout_secs: u64,
    session: Option<Session>,
}

impl MqttBroker {
    pub fn new(cfg: &MqttConfig) -> Self {
        Self {
            options: build_options(cfg),
            connect_timeout_secs: cfg.connect_timeout_secs,
            session: None,
        }
    }

    fn teardown(&mut self) {
        if let Some(old) = self.session.take() {
            let _ = old.client.try_disconnect();
            old.poller.abort();
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        self.teardown();

        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), 10);
        let (tx, mut rx) = watch::channel(Link::Connecting);
        let poller = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        debug!(?ack, "broker connack");
                        let _ = tx.send(Link::Up);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {}", e);
                        let _ = tx.send(Link::Down(e.to_string()));
                        break;
                    }
                }
            }
        });

        // The watch::Ref borrows rx; it must be gone before rx moves into the session.
        let outcome = {
            let wait = tokio::time::timeout(
                Duration::from_secs(self.connect_timeout_secs),
                rx.wait_for(|l| *l != Link::Connecting),
            )
            .await;

            match wait {
                Ok(Ok(link)) => match &*link {
                    Link::Up => Ok(()),
                    Link::Down(e) => Err(BrokerError::Connect(e.clone())),
                    Link::Connecting => Err(BrokerError::Connect("no connack".into())),
                },
                Ok(Err(_)) => Err(BrokerError::Connect("event loop stopped".into())),
                Err(_) => Err(BrokerError::ConnectTimeout(self.connect_timeout_secs)),
            }
        };

        match outcome {
            Ok(()) => {
                info!(client_id = %self.options.client_id(), "connected to MQTT broker");
                self.session = Some(Session {
                    client,
                    link: rx,
                    poller,
                });
                Ok(())
            }
            Err(e) => {
                poller.abort();
                Err(e)
            }
        }
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        retain: bool,
        q: Qos,
    ) -> Result<(), BrokerError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| BrokerError::Transport("not connected".into()))?;

        let link = session.link.borrow().clone();
        if let Link::Down(e) = link {
            return Err(BrokerError::Transport(e));
        }

        let client = session.client.clone();
        client
            .publish(topic, qos(q), retain, payload.as_bytes().to_vec())
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;
        debug!(topic, payload, retain, "published");
        Ok(())
    }
}
