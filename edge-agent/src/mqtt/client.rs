//! rumqttc-backed MQTT client
//!
//! The event loop runs in a background task: it dispatches incoming publishes to
//! the registered handlers, keeps polling after connection errors (rumqttc
//! reconnects on the next poll) and restores subscriptions on every reconnect.

use super::{tls, MqttClient};
use crate::config::MqttConfig;
use crate::error::{AgentError, Result};
use crate::transport::{Message, MessageHandler};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS, TlsConfiguration,
    Transport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 64;

struct Route {
    filter: String,
    qos: QoS,
    handler: MessageHandler,
}

type Routes = Arc<RwLock<Vec<Route>>>;

pub struct RumqttClient {
    client: AsyncClient,
    routes: Routes,
    stopping: Arc<AtomicBool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Broker address parsed from `mqtt.url`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerEndpoint {
    /// Accepts `tcp://`, `mqtt://`, `ssl://`, `tls://`, `mqtts://` or a bare `host:port`
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = match url.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("tcp".to_string(), url),
        };
        let tls = match scheme.as_str() {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" => true,
            other => {
                return Err(AgentError::MalformedEntity(format!(
                    "unsupported MQTT scheme: {other}"
                )))
            }
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    AgentError::MalformedEntity(format!("invalid MQTT port in {url}"))
                })?;
                (host, port)
            }
            None => (rest, if tls { 8883 } else { 1883 }),
        };
        if host.is_empty() {
            return Err(AgentError::MalformedEntity(format!("missing MQTT host in {url}")));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl RumqttClient {
    /// Create the client and start its event loop (must run inside a tokio runtime)
    pub fn connect(config: &MqttConfig, client_id: &str) -> Result<Self> {
        let endpoint = BrokerEndpoint::parse(&config.url)?;
        let mut options = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if !config.username.is_empty() {
            options.set_credentials(config.username.clone(), config.password.clone());
        }
        if config.mtls || endpoint.tls {
            let tls_config = tls::client_config(config)?;
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(tls_config),
            )));
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let routes: Routes = Arc::new(RwLock::new(Vec::new()));
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            routes.clone(),
            stopping.clone(),
        ));

        info!(
            host = %endpoint.host,
            port = endpoint.port,
            tls = config.mtls || endpoint.tls,
            "MQTT client started"
        );
        Ok(Self {
            client,
            routes,
            stopping,
            event_loop: Mutex::new(Some(handle)),
        })
    }
}

#[async_trait]
impl MqttClient for RumqttClient {
    async fn subscribe(&self, filter: &str, qos: QoS, handler: MessageHandler) -> Result<()> {
        self.routes.write().push(Route {
            filter: filter.to_string(),
            qos,
            handler,
        });
        self.client
            .subscribe(filter, qos)
            .await
            .map_err(|e| AgentError::SubscribeFailed(format!("{filter}: {e}")))?;
        info!(filter, "subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| AgentError::PublishFailed(format!("{topic}: {e}")))
    }

    async fn disconnect(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| AgentError::PublishFailed(format!("disconnect: {e}")));

        let handle = self.event_loop.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(2), &mut handle).await.is_err() {
                handle.abort();
            }
        }
        info!("MQTT client disconnected");
        result
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    routes: Routes,
    stopping: Arc<AtomicBool>,
) {
    let mut connected_once = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                debug!(topic = %publish.topic, bytes = publish.payload.len(), "MQTT message received");
                dispatch(&routes, Message::new(publish.topic, publish.payload));
            }
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                if connected_once {
                    info!("MQTT reconnected, restoring subscriptions");
                    resubscribe(&client, &routes);
                } else {
                    info!("MQTT connected");
                    connected_once = true;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                error!("MQTT connection lost: {}, reconnecting", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

fn dispatch(routes: &Routes, message: Message) {
    let handlers: Vec<MessageHandler> = routes
        .read()
        .iter()
        .filter(|route| rumqttc::matches(&message.topic, &route.filter))
        .map(|route| route.handler.clone())
        .collect();
    if handlers.is_empty() {
        warn!(topic = %message.topic, "no handler for MQTT message");
    }
    for handler in handlers {
        handler(message.clone());
    }
}

fn resubscribe(client: &AsyncClient, routes: &Routes) {
    for route in routes.read().iter() {
        if let Err(e) = client.try_subscribe(route.filter.clone(), route.qos) {
            warn!(filter = %route.filter, "failed to restore subscription: {}", e);
        }
    }
}
