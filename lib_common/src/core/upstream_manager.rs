//! # Upstream Connection Manager
//!
//! Owns the single persistent WebSocket to the upstream weather feed and is the
//! only writer of the station registry and the upstream connection state.
//!
//! ## State machine
//!
//! `Idle → Connecting → Connected ⇄ (Closed | Error) → Connecting (after delay)`
//!
//! - The run loop starts on the first token registration or the first
//!   subscriber attach. With no token it stays `Idle`.
//! - On open, discovery runs once per token and a `listen_start` frame is sent
//!   for every discovered device. Device labels are cumulative across
//!   reconnects.
//! - On close/error every known station is re-derived to `disconnected` and a
//!   reconnect is scheduled after a fixed delay.
//! - Discovery failures are retried on their own fixed timer, independent of
//!   the socket.
//!
//! Every transition is published as a `status` event; nothing escapes this
//! type as an error.
//!
//! One socket per process: it authenticates with the first registered token
//! and carries the subscriptions for every token's devices.
//!
//! This watchdog only looks at transport health. Data freshness is watched by
//! each subscriber's own health monitor, since the feed can go quiet while the
//! socket stays up.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::{self, protocol::Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::bus::{Bus, BusMessage, Subscription};
use crate::core::registry::StationRegistry;
use crate::weather::discovery::{DeviceDirectory, DiscoveredDevice};
use crate::weather::model::{ConnectionStatus, DeviceId, StatusEvent};
use crate::weather::normalizer::{attach_trend, normalize, Normalized};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection settings for the upstream feed.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// WebSocket endpoint; the token is appended as a `token` query parameter.
    pub ws_url: String,
    /// REST base used for device discovery.
    pub rest_url: String,
    /// Wait between a socket loss and the next connect attempt.
    pub reconnect_delay: Duration,
    /// Wait between failed discovery attempts.
    pub discovery_retry: Duration,
    /// A device to subscribe without discovery.
    pub static_device_id: Option<DeviceId>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws.weatherflow.com/swd/data".to_string(),
            rest_url: "https://swd.weatherflow.com/swd/rest/".to_string(),
            reconnect_delay: Duration::from_secs(5),
            discovery_retry: Duration::from_secs(30),
            static_device_id: None,
        }
    }
}

/// Lifecycle of the upstream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketState {
    /// Never started, or waiting for a token.
    #[default]
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Open and subscribed.
    Connected,
    /// Closed by the remote end; reconnect pending.
    Closed,
    /// Failed to open or broke mid-stream; reconnect pending.
    Error,
}

/// The process-wide upstream state. Written only by the manager.
#[derive(Debug, Clone, Default)]
pub struct UpstreamConnectionState {
    /// Current socket lifecycle state.
    pub socket_state: SocketState,
    /// Registered tokens, in registration order.
    pub tokens: Vec<String>,
    /// Every label ever discovered. Never cleared.
    pub device_labels: HashMap<DeviceId, String>,
}

#[derive(Debug)]
enum ManagerCommand {
    TokenAdded(String),
    Discovered {
        epoch: u64,
        devices: Vec<DiscoveredDevice>,
    },
    Forget(DeviceId),
}

enum SocketOutcome {
    Shutdown,
    Closed(Option<String>),
    Failed(String),
}

/// # Connection Manager
///
/// Construct one per process at the composition root and hand the `Arc` to
/// every subscriber adapter.
pub struct ConnectionManager {
    config: UpstreamConfig,
    directory: DeviceDirectory,
    bus: Bus,
    registry: Mutex<StationRegistry>,
    state: Mutex<UpstreamConnectionState>,
    config_error: Mutex<Option<String>>,
    last_global_error: Mutex<Option<StatusEvent>>,
    discovery_error: Mutex<Option<StatusEvent>>,
    epoch: AtomicU64,
    frame_seq: AtomicU64,
    commands: mpsc::UnboundedSender<ManagerCommand>,
    pending_commands: Mutex<Option<mpsc::UnboundedReceiver<ManagerCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// First four characters of a token, for logs.
pub fn mask_token(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{}…", prefix)
}

impl ConnectionManager {
    /// Builds an idle manager. Nothing connects until a token is registered
    /// or a subscriber attaches.
    ///
    /// # Errors
    /// Fails when `config.rest_url` is not an absolute URL.
    pub fn new(config: UpstreamConfig) -> anyhow::Result<Arc<Self>> {
        let directory = DeviceDirectory::new(&config.rest_url)?;
        let (commands, pending) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            config,
            directory,
            bus: Bus::new(),
            registry: Mutex::new(StationRegistry::new()),
            state: Mutex::new(UpstreamConnectionState::default()),
            config_error: Mutex::new(None),
            last_global_error: Mutex::new(None),
            discovery_error: Mutex::new(None),
            epoch: AtomicU64::new(0),
            frame_seq: AtomicU64::new(0),
            commands,
            pending_commands: Mutex::new(Some(pending)),
            task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }))
    }

    /// The bus this manager publishes on.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Current socket lifecycle state.
    pub fn socket_state(&self) -> SocketState {
        relock(&self.state).socket_state
    }

    /// A copy of the upstream connection state.
    pub fn connection_state(&self) -> UpstreamConnectionState {
        relock(&self.state).clone()
    }

    /// Adds tokens. Tokens already registered (and blank entries) are ignored,
    /// so calling this repeatedly with the same list is a no-op. Returns the
    /// number of genuinely new tokens.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register_tokens<S: AsRef<str>>(self: &Arc<Self>, tokens: &[S]) -> usize {
        let mut added = Vec::new();
        {
            let mut state = relock(&self.state);
            for token in tokens {
                let token = token.as_ref().trim();
                if token.is_empty() || state.tokens.iter().any(|t| t == token) {
                    continue;
                }
                state.tokens.push(token.to_string());
                added.push(token.to_string());
            }
        }

        if added.is_empty() {
            return 0;
        }

        relock(&self.config_error).take();
        for token in &added {
            log::info!("Registered upstream token {}", mask_token(token));
            let _ = self.commands.send(ManagerCommand::TokenAdded(token.clone()));
        }
        self.ensure_started();
        added.len()
    }

    /// Records a configuration-class fault (missing token, bad URL). It is
    /// published immediately and replayed to every subscriber that attaches
    /// afterwards, until a token is registered.
    pub fn report_configuration_error(&self, message: impl Into<String>) {
        let message = message.into();
        log::error!("Configuration error: {}", message);
        let registry = relock(&self.registry);
        *relock(&self.config_error) = Some(message.clone());
        self.bus
            .publish_status(StatusEvent::global(ConnectionStatus::Error, Some(message)));
        drop(registry);
    }

    /// Stops listening to one device on the current socket.
    pub fn forget_device(&self, device_id: DeviceId) {
        let _ = self.commands.send(ManagerCommand::Forget(device_id));
    }

    /// Status events describing the world as it stands now: a pending
    /// configuration or socket error first, then one event per station.
    pub fn snapshot(&self) -> Vec<StatusEvent> {
        let registry = relock(&self.registry);
        self.snapshot_locked(&registry)
    }

    fn snapshot_locked(&self, registry: &StationRegistry) -> Vec<StatusEvent> {
        let mut events = Vec::with_capacity(registry.len() + 1);
        if let Some(message) = relock(&self.config_error).clone() {
            events.push(StatusEvent::global(ConnectionStatus::Error, Some(message)));
        } else if let Some(error) = relock(&self.last_global_error).clone() {
            events.push(error);
        } else if let Some(error) = relock(&self.discovery_error).clone() {
            events.push(error);
        }
        events.extend(registry.snapshot());
        events
    }

    /// Replays the snapshot into `forward`, then registers it on every topic.
    /// Both happen under the registry lock, so no live event can slip in
    /// between or ahead of the snapshot.
    pub(crate) fn replay_and_subscribe<F>(self: &Arc<Self>, forward: F) -> Vec<Subscription>
    where
        F: Fn(BusMessage) + Send + Sync + 'static,
    {
        self.ensure_started();
        let registry = relock(&self.registry);
        for status in self.snapshot_locked(&registry) {
            forward(BusMessage::Status(Arc::new(status)));
        }
        let subscriptions = self.bus.on_all(forward);
        drop(registry);
        subscriptions
    }

    /// Starts the run loop if it has not been started yet.
    pub fn ensure_started(self: &Arc<Self>) {
        let pending = relock(&self.pending_commands).take();
        if let Some(commands) = pending {
            log::info!("Starting upstream connection manager");
            let handle = tokio::spawn(Arc::clone(self).run(commands));
            *relock(&self.task) = Some(handle);
        }
    }

    /// Sends `listen_stop` for every active device, closes the socket and
    /// waits for the run loop to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = relock(&self.task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        log::info!("Upstream connection manager stopped");
    }

    fn primary_token(&self) -> Option<String> {
        relock(&self.state).tokens.first().cloned()
    }

    fn set_socket_state(&self, next: SocketState) {
        let mut state = relock(&self.state);
        if state.socket_state != next {
            log::debug!("Upstream socket {:?} -> {:?}", state.socket_state, next);
            state.socket_state = next;
        }
    }

    fn label_for(&self, device_id: DeviceId) -> Option<String> {
        relock(&self.state).device_labels.get(&device_id).cloned()
    }

    async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<ManagerCommand>) {
        loop {
            let token = loop {
                if let Some(token) = self.primary_token() {
                    break token;
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    command = commands.recv() => match command {
                        Some(command) => self.handle_offline_command(command),
                        None => return,
                    },
                }
            };

            self.set_socket_state(SocketState::Connecting);
            match self.socket_url(&token) {
                Ok(url) => {
                    log::info!("Connecting to upstream feed {} (token {})", self.config.ws_url, mask_token(&token));
                    let attempt = tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        attempt = connect_async(url.as_str()) => attempt,
                    };
                    match attempt {
                        Ok((socket, _)) => {
                            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                            self.on_open();
                            match self.serve_socket(socket, epoch, &mut commands).await {
                                SocketOutcome::Shutdown => return,
                                SocketOutcome::Closed(reason) => {
                                    log::warn!("Upstream socket closed: {}", reason.as_deref().unwrap_or("no reason given"));
                                    self.on_socket_down(SocketState::Closed, None);
                                }
                                SocketOutcome::Failed(error) => {
                                    log::error!("Upstream socket error: {}", error);
                                    self.on_socket_down(SocketState::Error, Some(format!("Upstream socket error: {}", error)));
                                }
                            }
                        }
                        Err(e) => {
                            log::error!("Failed to connect to upstream feed: {}", e);
                            self.on_socket_down(SocketState::Error, Some(describe_connect_error(&e)));
                        }
                    }
                }
                Err(message) => {
                    log::error!("{}", message);
                    self.on_socket_down(SocketState::Error, Some(message));
                }
            }

            log::info!("Reconnecting to upstream in {:?}", self.config.reconnect_delay);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    fn socket_url(&self, token: &str) -> Result<Url, String> {
        let mut url = Url::parse(&self.config.ws_url)
            .map_err(|e| format!("Failed to create WebSocket connection: invalid upstream URL {}: {}", self.config.ws_url, e))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }

    /// Commands that arrive while no socket is open. Only label bookkeeping
    /// matters here; listens are re-issued by the next connection anyway.
    fn handle_offline_command(&self, command: ManagerCommand) {
        match command {
            ManagerCommand::Discovered { devices, .. } => self.apply_discovery(&devices),
            ManagerCommand::TokenAdded(_) | ManagerCommand::Forget(_) => {}
        }
    }

    async fn serve_socket(
        self: &Arc<Self>,
        socket: UpstreamSocket,
        epoch: u64,
        commands: &mut mpsc::UnboundedReceiver<ManagerCommand>,
    ) -> SocketOutcome {
        let (mut write, mut read) = socket.split();
        let mut listening: BTreeSet<DeviceId> = BTreeSet::new();
        let mut discovering: HashSet<String> = HashSet::new();

        let tokens = relock(&self.state).tokens.clone();
        for token in tokens {
            if discovering.insert(token.clone()) {
                self.spawn_discovery(token, epoch);
            }
        }

        if let Some(device_id) = self.config.static_device_id {
            let label = self
                .label_for(device_id)
                .unwrap_or_else(|| format!("Device {}", device_id));
            self.apply_discovery(&[DiscoveredDevice { device_id, label }]);
            listening.insert(device_id);
            if let Err(e) = write.send(self.control_frame("listen_start", device_id)).await {
                return SocketOutcome::Failed(e.to_string());
            }
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    for device_id in &listening {
                        let _ = write.send(self.control_frame("listen_stop", *device_id)).await;
                    }
                    let _ = write.close().await;
                    return SocketOutcome::Shutdown;
                }
                command = commands.recv() => match command {
                    None => return SocketOutcome::Shutdown,
                    Some(ManagerCommand::TokenAdded(token)) => {
                        if discovering.insert(token.clone()) {
                            self.spawn_discovery(token, epoch);
                        }
                    }
                    Some(ManagerCommand::Discovered { epoch: found_in, devices }) => {
                        self.apply_discovery(&devices);
                        if found_in != epoch {
                            continue;
                        }
                        for device in devices {
                            if listening.insert(device.device_id) {
                                if let Err(e) = write.send(self.control_frame("listen_start", device.device_id)).await {
                                    return SocketOutcome::Failed(e.to_string());
                                }
                            }
                        }
                    }
                    Some(ManagerCommand::Forget(device_id)) => {
                        if listening.remove(&device_id) {
                            if let Err(e) = write.send(self.control_frame("listen_stop", device_id)).await {
                                return SocketOutcome::Failed(e.to_string());
                            }
                        }
                    }
                },
                message = read.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => self.handle_frame(text.as_str()),
                    Some(Ok(WsMessage::Close(frame))) => {
                        return SocketOutcome::Closed(frame.map(|f| f.reason.as_str().to_owned()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SocketOutcome::Failed(e.to_string()),
                    None => return SocketOutcome::Closed(None),
                },
            }
        }
    }

    fn control_frame(&self, kind: &str, device_id: DeviceId) -> WsMessage {
        let seq = self.frame_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = json!({
            "type": kind,
            "device_id": device_id,
            "id": format!("listen-{}-{}", device_id, seq),
        });
        log::debug!("Sending upstream: {}", frame);
        WsMessage::Text(frame.to_string().into())
    }

    fn spawn_discovery(self: &Arc<Self>, token: String, epoch: u64) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if manager.shutdown.is_cancelled() || manager.epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                match manager.directory.fetch_devices(&token).await {
                    Ok(devices) => {
                        log::info!("Discovered {} device(s) for token {}", devices.len(), mask_token(&token));
                        manager.clear_discovery_error();
                        let _ = manager.commands.send(ManagerCommand::Discovered { epoch, devices });
                        return;
                    }
                    Err(e) => {
                        log::warn!(
                            "Device discovery for token {} failed: {}. Retrying in {:?}",
                            mask_token(&token),
                            e,
                            manager.config.discovery_retry
                        );
                        manager.report_discovery_failure(format!("Device discovery failed: {}", e));
                    }
                }
                tokio::select! {
                    _ = manager.shutdown.cancelled() => return,
                    _ = sleep(manager.config.discovery_retry) => {}
                }
            }
        });
    }

    fn apply_discovery(&self, devices: &[DiscoveredDevice]) {
        {
            let mut state = relock(&self.state);
            for device in devices {
                state.device_labels.insert(device.device_id, device.label.clone());
            }
        }

        let mut registry = relock(&self.registry);
        for device in devices {
            let station = registry.get_or_create(device.device_id);
            station.label = Some(device.label.clone());
            station.connection_status = ConnectionStatus::Connected;
            self.bus.publish_status(StatusEvent::device(
                device.device_id,
                ConnectionStatus::Connected,
                Some(device.label.clone()),
            ));
        }
    }

    fn handle_frame(&self, text: &str) {
        let Some(normalized) = normalize(text) else {
            return;
        };

        let mut registry = relock(&self.registry);
        match normalized {
            Normalized::Observation(mut observation) => {
                let Some(device_id) = observation.device_id else {
                    return;
                };
                let label = self.label_for(device_id);
                let station = registry.get_or_create(device_id);
                if station.label.is_none() {
                    station.label = label;
                }
                station.last_seen = Some(Utc::now());
                attach_trend(&mut observation, &mut station.pressure_history);

                if let Some(status) = registry.set_status(device_id, ConnectionStatus::Connected) {
                    self.bus.publish_status(status);
                }
                self.bus.publish_data(observation);
            }
            Normalized::Event(event) => {
                let label = self.label_for(event.device_id);
                let station = registry.get_or_create(event.device_id);
                if station.label.is_none() {
                    station.label = label;
                }
                station.last_seen = Some(Utc::now());

                if let Some(status) = registry.set_status(event.device_id, ConnectionStatus::Connected) {
                    self.bus.publish_status(status);
                }
                self.bus.publish_event(event);
            }
        }
    }

    fn publish_global(&self, status: ConnectionStatus, error: Option<String>) {
        let _registry = relock(&self.registry);
        let event = StatusEvent::global(status, error);
        *relock(&self.last_global_error) = (status == ConnectionStatus::Error).then(|| event.clone());
        self.bus.publish_status(event);
    }

    /// Stored apart from the socket error. The snapshot replays it only while
    /// no socket error is pending.
    fn report_discovery_failure(&self, message: String) {
        let _registry = relock(&self.registry);
        let event = StatusEvent::global(ConnectionStatus::Error, Some(message));
        *relock(&self.discovery_error) = Some(event.clone());
        self.bus.publish_status(event);
    }

    fn clear_discovery_error(&self) {
        relock(&self.discovery_error).take();
    }

    fn on_open(&self) {
        log::info!("Connected to upstream feed");
        self.set_socket_state(SocketState::Connected);
        self.publish_global(ConnectionStatus::Connected, None);
    }

    fn on_socket_down(&self, next: SocketState, error: Option<String>) {
        self.set_socket_state(next);
        let status = if error.is_some() {
            ConnectionStatus::Error
        } else {
            ConnectionStatus::Disconnected
        };
        self.publish_global(status, error);

        let mut registry = relock(&self.registry);
        for event in registry.disconnect_all() {
            self.bus.publish_status(event);
        }
    }
}

/// Bad URLs and rejected credentials are configuration problems, everything
/// else is a transient transport failure.
fn describe_connect_error(error: &tungstenite::Error) -> String {
    match error {
        tungstenite::Error::Url(e) => format!("Failed to create WebSocket connection: {}", e),
        tungstenite::Error::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            format!("Failed to create WebSocket connection: upstream rejected the token (HTTP {})", response.status())
        }
        other => format!("Upstream connection failed: {}", other),
    }
}
