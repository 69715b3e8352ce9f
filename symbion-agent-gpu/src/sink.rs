//! MQTT sink for published GPU state
//!
//! Handles:
//! - Broker connection with a bounded wait for CONNACK (fatal at startup)
//! - Retained availability topic with an `offline` last-will
//! - Background event loop driving the rumqttc client
//! - Fire-and-forget publishing with a per-publish timeout

use std::future::Future;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, LastWill, MqttOptions,
    Outgoing, QoS,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::supervisor::catch_panics;

pub const AVAILABILITY_ONLINE: &str = "online";
pub const AVAILABILITY_OFFLINE: &str = "offline";

/// Capacity of rumqttc's request queue
const REQUEST_QUEUE_CAPACITY: usize = 10;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Bound on waiting for the event loop after DISCONNECT was queued
const DRIVER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Topic carrying the state of one GPU
pub fn state_topic(base_topic: &str, gpu_uuid: &str) -> String {
    format!("{}/{}/state", base_topic, gpu_uuid)
}

pub fn availability_topic(base_topic: &str) -> String {
    format!("{}/availability", base_topic)
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("mqtt client error: {0}")]
    Client(#[from] ClientError),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("publish rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to connect to mqtt broker: {0}")]
    Connection(#[from] ConnectionError),
    #[error("mqtt broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("no answer from mqtt broker within {0:?}")]
    Timeout(Duration),
}

/// Destination of published state
pub trait Publisher: Send + Sync + 'static {
    fn publish(
        &self,
        payload: String,
        topic: &str,
        retained: bool,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}

#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    publish_timeout: Duration,
}

impl Publisher for MqttPublisher {
    async fn publish(&self, payload: String, topic: &str, retained: bool) -> Result<(), PublishError> {
        let request = self.client.publish(topic, QoS::AtMostOnce, retained, payload);
        match tokio::time::timeout(self.publish_timeout, request).await {
            Ok(result) => result.map_err(PublishError::from),
            Err(_) => Err(PublishError::Timeout(self.publish_timeout)),
        }
    }
}

/// Connected MQTT session
pub struct MqttSink {
    publisher: MqttPublisher,
    availability_topic: String,
    stop: CancellationToken,
    driver: JoinHandle<()>,
}

impl MqttSink {
    /// Connect to the broker and start driving the event loop
    pub async fn connect(config: &MqttConfig, base_topic: &str) -> Result<Self, SinkError> {
        let client_id = config.client_id.clone().unwrap_or_else(|| "symbion-gpu-unknown".to_string());
        let availability_topic = availability_topic(base_topic);

        let mut options = MqttOptions::new(client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            &availability_topic,
            AVAILABILITY_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);

        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        tokio::time::timeout(connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| SinkError::Timeout(connect_timeout))??;
        info!(host = %config.broker_host, port = config.broker_port, "connected to mqtt broker");

        let stop = CancellationToken::new();
        let driver = tokio::spawn(catch_panics("mqtt-eventloop", drive_event_loop(eventloop, stop.clone())));

        Ok(Self {
            publisher: MqttPublisher {
                client,
                publish_timeout: Duration::from_secs(config.publish_timeout_secs),
            },
            availability_topic,
            stop,
            driver,
        })
    }

    pub fn publisher(&self) -> MqttPublisher {
        self.publisher.clone()
    }

    /// Retained `online` marker on the availability topic
    pub async fn announce_online(&self) -> Result<(), PublishError> {
        self.publisher
            .publish(AVAILABILITY_ONLINE.to_string(), &self.availability_topic, true)
            .await
    }

    /// Publish `offline`, disconnect, and stop the event loop
    ///
    /// Bounded by the publish timeout plus a fixed wait for the event loop,
    /// even when the broker has disappeared.
    pub async fn close(self) {
        if let Err(e) = self
            .publisher
            .publish(AVAILABILITY_OFFLINE.to_string(), &self.availability_topic, true)
            .await
        {
            warn!(error = %e, "failed to publish offline availability");
        }

        // never wait on the request queue: it stays full while the broker is gone
        if let Err(e) = self.publisher.client.try_disconnect() {
            warn!(error = %e, "failed to request mqtt disconnect");
        }

        // the driver exits on the outgoing DISCONNECT; the token covers a dead broker
        if tokio::time::timeout(DRIVER_STOP_TIMEOUT, self.driver).await.is_err() {
            self.stop.cancel();
            warn!("mqtt event loop did not stop, abandoning connection");
        } else {
            info!("disconnected from mqtt broker");
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), SinkError> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Incoming::ConnAck(ack)) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(SinkError::Refused(code)),
                };
            }
            event => debug!(?event, "mqtt event before connack"),
        }
    }
}

/// Poll the rumqttc event loop until DISCONNECT is sent or `stop` fires
async fn drive_event_loop(mut eventloop: EventLoop, stop: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => info!("reconnected to mqtt broker"),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("mqtt disconnect sent");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "connection to mqtt broker lost");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            },
        }
    }
    debug!("mqtt event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_topics() {
        assert_eq!(
            state_topic("base", "GPU-00000000-0000-0000-0000-000000000000"),
            "base/GPU-00000000-0000-0000-0000-000000000000/state"
        );
        assert_eq!(availability_topic("smi2mqtt"), "smi2mqtt/availability");
    }

    /// Accept one client, answer its CONNECT with a CONNACK, then vanish
    async fn vanishing_broker() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = socket.read(&mut buf).await.unwrap();
            // CONNACK, session not present, accepted
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            socket.flush().await.unwrap();
            drop(socket);
            drop(listener);
        });
        port
    }

    #[tokio::test]
    async fn test_close_is_bounded_after_broker_disappears() {
        let config = MqttConfig {
            broker_host: "127.0.0.1".to_string(),
            broker_port: vanishing_broker().await,
            client_id: Some("symbion-gpu-test".to_string()),
            connect_timeout_secs: 5,
            publish_timeout_secs: 1,
            ..MqttConfig::default()
        };
        let sink = MqttSink::connect(&config, "smi2mqtt").await.unwrap();
        let publisher = sink.publisher();

        // fill the request queue until a publish can no longer be enqueued
        let mut saw_timeout = false;
        for i in 0..100 {
            let topic = state_topic("smi2mqtt", "GPU-00000000-0000-0000-0000-000000000000");
            if let Err(e) = publisher.publish(format!("{{\"n\":{}}}", i), &topic, false).await {
                assert!(matches!(e, PublishError::Timeout(_)), "unexpected error: {}", e);
                saw_timeout = true;
                break;
            }
        }
        assert!(saw_timeout);

        let started = std::time::Instant::now();
        let closed = tokio::time::timeout(Duration::from_secs(10), sink.close()).await;
        assert!(closed.is_ok(), "close hung for {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn test_connect_fails_fast_without_broker() {
        let config = MqttConfig {
            broker_host: "127.0.0.1".to_string(),
            // reserved port, nothing listens there
            broker_port: 1,
            connect_timeout_secs: 2,
            ..MqttConfig::default()
        };

        let result = MqttSink::connect(&config, "smi2mqtt").await;
        assert!(matches!(result, Err(SinkError::Connection(_)) | Err(SinkError::Timeout(_))));
    }
}
