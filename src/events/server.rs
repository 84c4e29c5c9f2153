//! WebSocket server for tracking control and events
//!
//! Every accepted connection is subscribed to the [`EventHub`] and can send
//! commands. The connection task selects over inbound messages, queued events
//! and a ping ticker; a peer that sends nothing (not even a pong) for
//! [`MISSED_PINGS`] intervals is dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};

use super::handlers::CommandHandler;
use super::hub::{EventHub, Subscription};
use super::protocol::Command;
use crate::config::EventsConfig;

/// Ping intervals without inbound traffic before a connection is dropped
pub const MISSED_PINGS: u32 = 3;

/// Tick period used when liveness checks are off
const IDLE_TICK: Duration = Duration::from_secs(3600);

/// Event server errors
#[derive(Debug, thiserror::Error)]
pub enum EventServerError {
    #[error("failed to bind event server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Shared by all connection tasks
struct ConnectionContext {
    hub: Arc<EventHub>,
    handler: CommandHandler,
    ping_interval: Option<Duration>,
    stop_when_idle: bool,
}

/// WebSocket server for the tracker
pub struct EventServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<ConnectionContext>,
}

impl EventServer {
    /// Bind the configured address
    pub async fn bind(
        config: &EventsConfig,
        hub: Arc<EventHub>,
        handler: CommandHandler,
    ) -> Result<Self, EventServerError> {
        let addr = format!("{}:{}", config.host, config.port);
        let bind_err = |source| EventServerError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        let ping_interval = (config.ping_interval_secs > 0)
            .then(|| Duration::from_secs(config.ping_interval_secs));

        Ok(Self {
            listener,
            local_addr,
            context: Arc::new(ConnectionContext {
                hub,
                handler,
                ping_interval,
                stop_when_idle: config.stop_when_idle,
            }),
        })
    }

    /// Override the ping period; `None` disables liveness checks
    ///
    /// Must be called before `run()`.
    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        if let Some(context) = Arc::get_mut(&mut self.context) {
            context.ping_interval = interval;
        }
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` turns true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("WebSocket server listening on ws://{}", self.local_addr);

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown_requested(&mut shutdown) => break,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("Failed to accept WebSocket connection: {}", e);
                    continue;
                }
            };

            let context = self.context.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, context, shutdown).await {
                    tracing::warn!("WebSocket connection from {} ended with error: {}", peer, e);
                }
            });
        }

        tracing::info!("WebSocket server stopped");
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<ConnectionContext>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), tungstenite::Error> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let subscription = context.hub.subscribe(peer);
    let id = subscription.id;

    let result = serve_subscriber(ws_stream, peer, subscription, &context, shutdown).await;

    let remaining = context.hub.unsubscribe(id);
    if remaining == 0 && context.stop_when_idle && context.handler.supervisor().is_running() {
        tracing::info!("Last subscriber left, stopping tracking");
        context.handler.stop_tracking().await;
    }

    result
}

async fn serve_subscriber(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    peer: SocketAddr,
    subscription: Subscription,
    context: &ConnectionContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), tungstenite::Error> {
    let Subscription { id, mut events } = subscription;
    let (mut write, mut read) = ws_stream.split();

    let period = context.ping_interval.unwrap_or(IDLE_TICK);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = read.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Some(command) = Command::parse(&text) else {
                            continue;
                        };
                        tracing::debug!(subscriber = %id, ?command, "Command received");
                        if let Some(reply) = context.handler.handle(command).await {
                            match reply.to_json() {
                                Ok(json) => write.send(Message::Text(json)).await?,
                                Err(e) => tracing::error!("Failed to serialize reply: {}", e),
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!(subscriber = %id, "Client {} disconnected", peer);
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(subscriber = %id, "WebSocket error from {}: {}", peer, e);
                        break;
                    }
                    None => break,
                    // Pings are answered by tungstenite; pongs only refresh liveness
                    Some(Ok(_)) => {}
                }
            }

            event = events.recv() => {
                let Some(payload) = event else {
                    break;
                };
                if let Err(e) = write.send(Message::Text(payload.to_string())).await {
                    tracing::info!(subscriber = %id, "Dropping subscriber {}: {}", peer, e);
                    break;
                }
            }

            _ = ticker.tick(), if context.ping_interval.is_some() => {
                if last_seen.elapsed() >= period * MISSED_PINGS {
                    tracing::info!(
                        subscriber = %id,
                        "No traffic from {} for {:?}, dropping",
                        peer,
                        last_seen.elapsed()
                    );
                    break;
                }
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            _ = shutdown_requested(&mut shutdown) => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::events::handlers::ModelSelection;
    use crate::events::protocol::Event;
    use crate::pipeline::testing::{DeviceLedger, StubDevices};
    use crate::pipeline::{PipelineState, PipelineSupervisor};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct Harness {
        addr: SocketAddr,
        hub: Arc<EventHub>,
        supervisor: Arc<PipelineSupervisor>,
        ledger: Arc<DeviceLedger>,
        shutdown: watch::Sender<bool>,
    }

    impl Harness {
        async fn start(configure: impl FnOnce(&mut TrackerConfig), ping: Option<Duration>) -> Self {
            let mut config = TrackerConfig::default();
            config.camera.width = 32;
            config.camera.height = 24;
            config.stream.host = "127.0.0.1".to_string();
            config.stream.port = 0;
            config.events.host = "127.0.0.1".to_string();
            config.events.port = 0;
            configure(&mut config);

            let devices = StubDevices::default();
            let ledger = devices.ledger();
            let hub = Arc::new(EventHub::new());
            let supervisor = Arc::new(PipelineSupervisor::new(
                config.clone(),
                Arc::new(devices),
                hub.clone(),
                tokio::runtime::Handle::current(),
            ));
            let handler = CommandHandler::new(supervisor.clone(), Arc::new(ModelSelection::new()));
            let server = EventServer::bind(&config.events, hub.clone(), handler)
                .await
                .unwrap()
                .with_ping_interval(ping);
            let addr = server.local_addr();

            let (shutdown, shutdown_rx) = watch::channel(false);
            tokio::spawn(server.run(shutdown_rx));

            Self {
                addr,
                hub,
                supervisor,
                ledger,
                shutdown,
            }
        }

        async fn connect(&self) -> Client {
            let (client, _) = connect_async(format!("ws://{}", self.addr)).await.unwrap();
            client
        }

        async fn wait_for_subscribers(&self, count: usize) {
            let deadline = Instant::now() + Duration::from_secs(3);
            while self.hub.len() != count {
                assert!(Instant::now() < deadline, "expected {} subscribers", count);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        async fn shutdown(self) {
            let supervisor = self.supervisor.clone();
            tokio::task::spawn_blocking(move || supervisor.stop()).await.unwrap();
            let _ = self.shutdown.send(true);
        }
    }

    async fn send(client: &mut Client, text: &str) {
        client.send(Message::Text(text.to_string())).await.unwrap();
    }

    /// Next text frame whose `type` is not a routine broadcast
    async fn next_reply(client: &mut Client) -> serde_json::Value {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let msg = tokio::time::timeout_at(deadline, client.next())
                .await
                .expect("reply in time")
                .expect("connection open")
                .unwrap();
            if let Message::Text(text) = msg {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                match value.get("type").and_then(|t| t.as_str()) {
                    Some("face_data") | Some("fps") => continue,
                    _ => return value,
                }
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_get_config_reply() {
        let harness = Harness::start(|c| c.model.default = "Haru".to_string(), None).await;
        let mut client = harness.connect().await;

        send(&mut client, r#"{"command": "get_config"}"#).await;
        assert_eq!(
            next_reply(&mut client).await,
            serde_json::json!({"camera": {"resolution": "32x24", "fps": 30}, "model": {"default": "Haru"}})
        );

        harness.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_default_config_reply_is_exact() {
        let harness = Harness::start(
            |c| {
                c.camera.width = 1280;
                c.camera.height = 720;
            },
            None,
        )
        .await;
        let mut client = harness.connect().await;

        send(&mut client, r#"{"command": "get_config"}"#).await;
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            msg,
            Message::Text(r#"{"camera":{"resolution":"1280x720","fps":30},"model":{"default":"Haru"}}"#.to_string())
        );

        harness.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_command_is_ignored() {
        let harness = Harness::start(|_| {}, None).await;
        let mut client = harness.connect().await;

        send(&mut client, r#"{"command": "self_destruct"}"#).await;
        send(&mut client, "garbage").await;
        send(&mut client, r#"{"command": "get_config"}"#).await;

        let reply = next_reply(&mut client).await;
        assert!(reply.get("camera").is_some());
        assert_eq!(harness.supervisor.state(), PipelineState::Idle);

        harness.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_double_start_runs_one_pipeline_and_reports_rejection() {
        let harness = Harness::start(|_| {}, None).await;
        let mut client = harness.connect().await;

        send(&mut client, r#"{"command": "start_tracking"}"#).await;
        send(&mut client, r#"{"command": "start_tracking"}"#).await;

        let reply = next_reply(&mut client).await;
        assert_eq!(
            reply,
            serde_json::json!({"type": "error", "data": "tracking is already running"})
        );
        assert_eq!(harness.supervisor.state(), PipelineState::Running);
        assert_eq!(harness.ledger.sources_opened(), 1);

        // Commands run in order, so the config reply means stop has returned
        send(&mut client, r#"{"command": "stop_tracking"}"#).await;
        send(&mut client, r#"{"command": "get_config"}"#).await;
        let reply = next_reply(&mut client).await;
        assert!(reply.get("camera").is_some());
        assert_eq!(harness.supervisor.state(), PipelineState::Idle);
        assert_eq!(harness.ledger.sources_open(), 0);
        assert_eq!(harness.ledger.virtual_cameras_open(), 0);

        harness.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_broadcast_reaches_all_clients() {
        let harness = Harness::start(|_| {}, None).await;
        let mut first = harness.connect().await;
        let mut second = harness.connect().await;
        harness.wait_for_subscribers(2).await;

        harness.hub.publish(&Event::Fps(12.5));

        for client in [&mut first, &mut second] {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(msg, Message::Text(r#"{"type":"fps","data":12.5}"#.to_string()));
        }

        drop(first);
        harness.wait_for_subscribers(1).await;
        assert_eq!(harness.hub.publish(&Event::Fps(1.0)), 1);

        harness.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_last_disconnect_stops_tracking_when_configured() {
        let harness = Harness::start(|c| c.events.stop_when_idle = true, None).await;
        let mut client = harness.connect().await;

        send(&mut client, r#"{"command": "start_tracking"}"#).await;
        let deadline = Instant::now() + Duration::from_secs(5);
        while !harness.supervisor.is_running() {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        client.close(None).await.unwrap();
        drop(client);

        // State flips to Idle before the devices are released; wait on the devices
        let deadline = Instant::now() + Duration::from_secs(5);
        while harness.ledger.sources_open() > 0 {
            assert!(Instant::now() < deadline, "tracking should stop with the last subscriber");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!harness.supervisor.is_running());

        harness.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_silent_peer_is_dropped() {
        let harness = Harness::start(|_| {}, Some(Duration::from_millis(50))).await;

        // Never polled, so pings go unanswered
        let _silent = harness.connect().await;
        harness.wait_for_subscribers(1).await;
        harness.wait_for_subscribers(0).await;

        harness.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_responsive_peer_survives_pings() {
        let harness = Harness::start(|_| {}, Some(Duration::from_millis(50))).await;
        let mut client = harness.connect().await;
        harness.wait_for_subscribers(1).await;

        // Reading lets tungstenite answer each ping
        let _ = tokio::time::timeout(Duration::from_millis(400), async {
            while client.next().await.is_some() {}
        })
        .await;
        assert_eq!(harness.hub.len(), 1);

        harness.shutdown().await;
    }
}
