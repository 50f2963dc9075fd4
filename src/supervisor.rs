//! Network and broker liveness around publishing.

use crate::discovery::{format_watts, Topics};
use crate::error::{BrokerError, ConnectivityError};
use crate::mqtt::{Broker, Qos};
use crate::net::Network;
use crate::power::Reading;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    pub messages: usize,
    /// 1 when the first try went through, 2 after a reconnect-and-retry.
    pub attempts: u8,
}

pub struct ConnectivitySupervisor {
    network: Box<dyn Network>,
    broker: Box<dyn Broker>,
    topics: Topics,
}

impl ConnectivitySupervisor {
    pub fn new(network: Box<dyn Network>, broker: Box<dyn Broker>, topics: Topics) -> Self {
        Self {
            network,
            broker,
            topics,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Blocks until the network is up; returns the local address.
    pub async fn bring_up_network(&mut self) -> Result<String, ConnectivityError> {
        Ok(self.network.connect().await?)
    }

    pub async fn open_session(&mut self) -> Result<(), ConnectivityError> {
        Ok(self.broker.connect().await?)
    }

    /// Publish the discovery document for every channel. Retained, so
    /// repeating it after a reconnect is harmless.
    pub async fn announce<'a, I>(&mut self, channels: I) -> Result<usize, ConnectivityError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut sent = 0;
        for channel in channels {
            let doc = self.topics.sensor(channel);
            let payload = serde_json::to_string(&doc).map_err(BrokerError::from)?;
            self.broker
                .publish(
                    &self.topics.discovery_topic(channel),
                    &payload,
                    true,
                    Qos::AtLeastOnce,
                )
                .await?;
            sent += 1;
        }
        info!(channels = sent, "published discovery metadata");
        Ok(sent)
    }

    async fn reconnect(&mut self) -> Result<(), ConnectivityError> {
        let addr = self.network.connect().await?;
        self.broker.connect().await?;
        info!(local = %addr, "reconnected network and broker");
        Ok(())
    }

    async fn publish_readings(&mut self, readings: &[Reading]) -> Result<usize, BrokerError> {
        for r in readings {
            let topic = self.topics.state_topic(&r.channel);
            self.broker
                .publish(&topic, &format_watts(r.watts), false, Qos::AtMostOnce)
                .await?;
        }
        Ok(readings.len())
    }

    /// Publish one cycle's readings, reconnecting and retrying at most once.
    pub async fn publish_cycle(
        &mut self,
        readings: &[Reading],
    ) -> Result<Published, ConnectivityError> {
        if !self.network.is_connected().await {
            warn!("network down before publish; reconnecting");
            self.reconnect().await?;
        }

        match self.publish_readings(readings).await {
            Ok(messages) => {
                debug!(messages, "cycle published");
                Ok(Published {
                    messages,
                    attempts: 1,
                })
            }
            Err(e) if e.is_transport() => {
                warn!(error = %e, "publish failed; reconnecting and retrying once");
                self.reconnect().await?;
                let messages = self
                    .publish_readings(readings)
                    .await
                    .map_err(ConnectivityError::RetryExhausted)?;
                Ok(Published {
                    messages,
                    attempts: 2,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, MqttConfig};
    use crate::error::NetworkError;
    use crate::mqtt::MockBroker;
    use crate::net::MockNetwork;

    fn topics() -> Topics {
        let mqtt = MqttConfig {
            host: "broker".into(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: None,
            connect_timeout_secs: 10,
            discovery_prefix: "homeassistant".into(),
            state_prefix: "power/meter".into(),
        };
        Topics::new(&mqtt, &DeviceConfig::default())
    }

    fn readings() -> Vec<Reading> {
        [("total", 36_000.0), ("heater", 9_000.0), ("ftx", 3_600.0), ("household", 23_400.0)]
            .iter()
            .map(|(name, watts)| Reading {
                channel: name.to_string(),
                label: String::new(),
                watts: *watts,
                derived: *name == "household",
            })
            .collect()
    }

    fn online_network() -> MockNetwork {
        let mut net = MockNetwork::new();
        net.expect_is_connected().returning(|| true);
        net
    }

    #[tokio::test]
    async fn test_publish_cycle_happy_path() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .withf(|topic, _, retain, qos| {
                topic.starts_with("power/meter/") && !*retain && *qos == Qos::AtMostOnce
            })
            .times(4)
            .returning(|_, _, _, _| Ok(()));

        let mut sup = ConnectivitySupervisor::new(Box::new(online_network()), Box::new(broker), topics());
        let published = sup.publish_cycle(&readings()).await.unwrap();
        assert_eq!(
            published,
            Published {
                messages: 4,
                attempts: 1
            }
        );
    }

    #[tokio::test]
    async fn test_transport_error_reconnects_and_retries_once() {
        let mut net = online_network();
        net.expect_connect()
            .times(1)
            .returning(|| Ok("10.0.0.2".to_string()));

        let mut broker = MockBroker::new();
        broker.expect_connect().times(1).returning(|| Ok(()));
        let mut calls = 0;
        broker
            .expect_publish()
            .times(5)
            .returning(move |_, _, _, _| {
                calls += 1;
                if calls == 1 {
                    Err(BrokerError::Transport("connection reset".into()))
                } else {
                    Ok(())
                }
            });

        let mut sup = ConnectivitySupervisor::new(Box::new(net), Box::new(broker), topics());
        let published = sup.publish_cycle(&readings()).await.unwrap();
        assert_eq!(published.attempts, 2);
        assert_eq!(published.messages, 4);
    }

    #[tokio::test]
    async fn test_second_failure_is_fatal_for_cycle() {
        let mut net = online_network();
        net.expect_connect()
            .times(1)
            .returning(|| Ok("10.0.0.2".to_string()));

        let mut broker = MockBroker::new();
        broker.expect_connect().times(1).returning(|| Ok(()));
        broker
            .expect_publish()
            .times(2)
            .returning(|_, _, _, _| Err(BrokerError::Transport("broken pipe".into())));

        let mut sup = ConnectivitySupervisor::new(Box::new(net), Box::new(broker), topics());
        let err = sup.publish_cycle(&readings()).await.unwrap_err();
        assert!(matches!(err, ConnectivityError::RetryExhausted(_)));
    }

    #[tokio::test]
    async fn test_network_down_reconnects_before_publishing() {
        let mut net = MockNetwork::new();
        net.expect_is_connected().times(1).returning(|| false);
        net.expect_connect()
            .times(1)
            .returning(|| Ok("10.0.0.2".to_string()));

        let mut broker = MockBroker::new();
        broker.expect_connect().times(1).returning(|| Ok(()));
        broker.expect_publish().times(4).returning(|_, _, _, _| Ok(()));

        let mut sup = ConnectivitySupervisor::new(Box::new(net), Box::new(broker), topics());
        let published = sup.publish_cycle(&readings()).await.unwrap();
        assert_eq!(published.attempts, 1);
    }

    #[tokio::test]
    async fn test_reconnect_failure_propagates() {
        let mut net = MockNetwork::new();
        net.expect_is_connected().returning(|| false);
        net.expect_connect().times(1).returning(|| {
            Err(NetworkError::Unreachable {
                attempts: 3,
                reason: "no route to host".into(),
            })
        });

        let mut broker = MockBroker::new();
        broker.expect_publish().never();

        let mut sup = ConnectivitySupervisor::new(Box::new(net), Box::new(broker), topics());
        let err = sup.publish_cycle(&readings()).await.unwrap_err();
        assert!(matches!(err, ConnectivityError::Network(_)));
    }

    #[tokio::test]
    async fn test_announce_publishes_retained_discovery() {
        let mut broker = MockBroker::new();
        broker
            .expect_publish()
            .withf(|topic, payload, retain, qos| {
                topic.starts_with("homeassistant/sensor/uPower/upower-")
                    && topic.ends_with("/config")
                    && payload.contains("\"device_class\":\"power\"")
                    && *retain
                    && *qos == Qos::AtLeastOnce
            })
            .times(4)
            .returning(|_, _, _, _| Ok(()));

        let mut sup =
            ConnectivitySupervisor::new(Box::new(MockNetwork::new()), Box::new(broker), topics());
        let sent = sup
            .announce(["total", "heater", "ftx", "household"])
            .await
            .unwrap();
        assert_eq!(sent, 4);
    }
}
