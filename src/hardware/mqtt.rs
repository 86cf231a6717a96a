use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MqttConfig;
use crate::domain::{Broker, BrokerError, ConnectionEvent, PublishOptions};
use crate::publisher::OFFLINE;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);
/// Longest a publish may wait for room in the request queue
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// MQTT connection backed by rumqttc.
///
/// The event loop runs in its own task and reconnects on its own; every
/// transition is forwarded as a [`ConnectionEvent`].
pub struct MqttBroker {
    client: AsyncClient,
    ready: Arc<AtomicBool>,
    events: broadcast::Sender<ConnectionEvent>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBroker {
    /// `availability_topic` receives a retained "offline" if the connection
    /// drops without a clean shutdown.
    pub fn connect(cfg: &MqttConfig, availability_topic: &str) -> Self {
        let client_id = format!("{}-{}", cfg.client_id, &Uuid::new_v4().simple().to_string()[..8]);
        let mut options = MqttOptions::new(client_id.clone(), cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_seconds));
        if !cfg.username.is_empty() {
            options.set_credentials(cfg.username.clone(), cfg.password.clone());
        }
        options.set_last_will(LastWill::new(
            availability_topic,
            OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, event_loop) = AsyncClient::new(options, 32);
        let ready = Arc::new(AtomicBool::new(false));
        let (events, _) = broadcast::channel(16);

        info!(host = %cfg.host, port = cfg.port, %client_id, "connecting to MQTT broker");
        let handle = tokio::spawn(drive(event_loop, ready.clone(), events.clone()));

        Self {
            client,
            ready,
            events,
            event_loop: Mutex::new(Some(handle)),
        }
    }
}

async fn drive(
    mut event_loop: EventLoop,
    ready: Arc<AtomicBool>,
    events: broadcast::Sender<ConnectionEvent>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                ready.store(true, Ordering::SeqCst);
                let _ = events.send(ConnectionEvent::Connected);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                ready.store(false, Ordering::SeqCst);
                let _ = events.send(ConnectionEvent::Disconnected);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                ready.store(false, Ordering::SeqCst);
                let _ = events.send(ConnectionEvent::Disconnected);
                debug!("MQTT event loop finished");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if ready.swap(false, Ordering::SeqCst) {
                    let _ = events.send(ConnectionEvent::Disconnected);
                }
                let _ = events.send(ConnectionEvent::Error(e.to_string()));
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn publish(&self, topic: &str, payload: &str, options: PublishOptions) -> Result<()> {
        if !self.is_ready() {
            return Err(BrokerError::NotConnected.into());
        }
        let enqueue = self.client.publish(
            topic,
            QoS::AtLeastOnce,
            options.retain,
            payload.as_bytes().to_vec(),
        );
        let reason = match tokio::time::timeout(ENQUEUE_TIMEOUT, enqueue).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "request queue full".to_string(),
        };
        Err(BrokerError::Publish {
            topic: topic.to_string(),
            reason,
        }
        .into())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Requests are processed in order, so everything published before the
    /// disconnect is on the wire once the event loop ends.
    async fn close(&self) -> Result<()> {
        let Some(handle) = self.event_loop.lock().take() else {
            return Ok(());
        };
        if self.is_ready() {
            match tokio::time::timeout(ENQUEUE_TIMEOUT, self.client.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "MQTT disconnect request failed"),
                Err(_) => warn!("MQTT disconnect request timed out"),
            }
            if tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_ok() {
                return Ok(());
            }
            warn!("MQTT event loop did not finish in time");
        } else {
            handle.abort();
        }
        Ok(())
    }
}
