//! rumqttc-backed connection driver.

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::gauge;
use mqttpool_cluster::driver::DriverEventSender;
use mqttpool_cluster::{ConnectionDriver, DriverEvent};
use mqttpool_common::{Assignment, ClusterError, Result};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MqttSettings;

struct Session {
    client: AsyncClient,
    task: JoinHandle<()>,
}

/// Hosts one MQTT client per admitted assignment
pub struct MqttDriver {
    settings: MqttSettings,
    sessions: Arc<DashMap<String, Session>>,
    events: DriverEventSender,
}

impl MqttDriver {
    pub fn new(settings: MqttSettings, events: DriverEventSender) -> Self {
        Self {
            settings,
            sessions: Arc::new(DashMap::new()),
            events,
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn options(&self, assignment: &Assignment) -> MqttOptions {
        let params = &assignment.params;
        let mut options = MqttOptions::new(assignment.id.clone(), params.broker.clone(), params.port);
        options.set_keep_alive(self.settings.keep_alive());
        if !params.username.is_empty() {
            options.set_credentials(params.username.clone(), params.password.clone());
        }
        options
    }

    async fn await_connack(eventloop: &mut EventLoop) -> std::result::Result<(), String> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    return if connack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(format!("CONNACK refused: {:?}", connack.code))
                    };
                }
                Ok(_) => continue,
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    /// Drive the event loop of `id` until the connection is lost. Reports the
    /// loss only if the session was not closed on purpose.
    fn spawn_event_loop(&self, id: String, mut eventloop: EventLoop) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let reason = loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        debug!(
                            "Message on {} for {} ({} bytes)",
                            publish.topic,
                            id,
                            publish.payload.len()
                        );
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        break "broker sent DISCONNECT".to_string();
                    }
                    Ok(_) => {}
                    Err(e) => break e.to_string(),
                }
            };

            if sessions.remove(&id).is_some() {
                gauge!("mqttpool.mqtt.sessions").set(sessions.len() as f64);
                if events
                    .send(DriverEvent::Disconnected {
                        id: id.clone(),
                        reason,
                    })
                    .is_err()
                {
                    warn!("Driver event channel closed; loss of {} not reported", id);
                }
            }
        })
    }

    /// Disconnect every hosted client
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.disconnect(&id).await {
                warn!("Disconnect of {} failed: {}", id, e);
            }
        }
    }
}

#[async_trait]
impl ConnectionDriver for MqttDriver {
    async fn connect(&self, assignment: &Assignment) -> Result<()> {
        let failed = |message: String| ClusterError::DriverFailed {
            id: assignment.id.clone(),
            message,
        };

        let (client, mut eventloop) =
            AsyncClient::new(self.options(assignment), self.settings.channel_capacity);

        match tokio::time::timeout(
            self.settings.connect_timeout(),
            Self::await_connack(&mut eventloop),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(message)) => return Err(failed(message)),
            Err(_) => {
                return Err(failed(format!(
                    "no CONNACK from {}:{} within {:?}",
                    assignment.params.broker,
                    assignment.params.port,
                    self.settings.connect_timeout()
                )))
            }
        }

        if let Err(e) = client
            .subscribe(assignment.params.sub_topic.clone(), QoS::AtLeastOnce)
            .await
        {
            let _ = client.disconnect().await;
            return Err(failed(format!("subscribe failed: {}", e)));
        }

        let task = self.spawn_event_loop(assignment.id.clone(), eventloop);
        self.sessions
            .insert(assignment.id.clone(), Session { client, task });
        gauge!("mqttpool.mqtt.sessions").set(self.sessions.len() as f64);

        info!(
            "MQTT client {} connected to {}:{}, subscribed to {}",
            assignment.id,
            assignment.params.broker,
            assignment.params.port,
            assignment.params.sub_topic
        );
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<()> {
        let Some((_, session)) = self.sessions.remove(id) else {
            return Ok(());
        };
        gauge!("mqttpool.mqtt.sessions").set(self.sessions.len() as f64);

        if let Err(e) = session.client.disconnect().await {
            debug!("DISCONNECT for {} not sent: {}", id, e);
        }
        session.task.abort();
        info!("MQTT client {} disconnected", id);
        Ok(())
    }
}
