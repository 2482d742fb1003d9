// Connection manager - one live transport per session, heartbeats and reconnection
use crate::application::backoff::BackoffPolicy;
use crate::application::event_transport::{EventTransport, TransportChannel};
use crate::application::subscription_registry::SubscriptionRegistry;
use crate::domain::envelope::{self, ClientEvent, Topic};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Observable state of the live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Set once reconnection gave up; consumers should fall back to polling.
    pub degraded: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            last_heartbeat_at: None,
            degraded: false,
        }
    }
}

/// Where the live channel should connect, resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// No endpoint configured or the channel is switched off.
    Disabled,
    /// Configured but unusable; the only path into `ConnectionStatus::Error`.
    Invalid(String),
    Ready(Url),
}

impl Endpoint {
    pub fn resolve(enabled: bool, endpoint: Option<&str>) -> Self {
        let Some(raw) = endpoint.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Endpoint::Disabled;
        };
        if !enabled {
            return Endpoint::Disabled;
        }
        match Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "ws" | "wss") => Endpoint::Ready(url),
            Ok(url) => Endpoint::Invalid(format!("unsupported scheme {:?}", url.scheme())),
            Err(e) => Endpoint::Invalid(e.to_string()),
        }
    }
}

/// Server feeds a session can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feed {
    Market,
    Assets,
    Bids,
}

impl Feed {
    pub fn topic(&self) -> Topic {
        match self {
            Feed::Market => Topic::MarketData,
            Feed::Assets => Topic::AssetUpdate,
            Feed::Bids => Topic::BidUpdate,
        }
    }

    fn request(&self) -> ClientEvent {
        match self {
            Feed::Market => ClientEvent::SubscribeMarket,
            Feed::Assets => ClientEvent::SubscribeAssets,
            Feed::Bids => ClientEvent::SubscribeBids,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub endpoint: Endpoint,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
}

struct Worker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

enum SessionEnd {
    Shutdown,
    Closed,
    Stale,
}

struct Shared {
    transport: Arc<dyn EventTransport>,
    registry: Arc<SubscriptionRegistry>,
    heartbeat_interval: Duration,
    backoff: BackoffPolicy,
    state: watch::Sender<SessionState>,
    outbound: RwLock<Option<tokio::sync::mpsc::Sender<String>>>,
    feeds: RwLock<BTreeSet<Feed>>,
}

/// Owns the single live transport of a session.
pub struct ConnectionManager {
    endpoint: Endpoint,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        transport: Arc<dyn EventTransport>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            endpoint: settings.endpoint,
            shared: Arc::new(Shared {
                transport,
                registry,
                heartbeat_interval: settings.heartbeat_interval,
                backoff: settings.backoff,
                state,
                outbound: RwLock::new(None),
                feeds: RwLock::new(BTreeSet::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Start the connection loop. Never fails: a disabled endpoint leaves the
    /// session `disconnected`, an invalid one moves it to `error`.
    pub async fn connect(&self) {
        let url = match &self.endpoint {
            Endpoint::Disabled => {
                debug!("Real-time channel disabled; staying disconnected");
                self.shared.update(|s| s.status = ConnectionStatus::Disconnected);
                return;
            }
            Endpoint::Invalid(reason) => {
                warn!("Real-time endpoint is misconfigured: {}", reason);
                self.shared.update(|s| s.status = ConnectionStatus::Error);
                return;
            }
            Endpoint::Ready(url) => url.clone(),
        };

        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            debug!("Connection loop already running");
            return;
        }

        let (shutdown, shutdown_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move { shared.run(url, shutdown_rx).await });
        *worker = Some(Worker { shutdown, handle });
    }

    /// Close the transport and cancel any pending reconnection. Requested feeds
    /// are kept and replayed on the next `connect`.
    pub async fn disconnect(&self) {
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.shutdown.send(());
            if let Err(e) = worker.handle.await {
                warn!("Connection loop ended abnormally: {}", e);
            }
        }
        *self.shared.outbound.write().await = None;
        self.shared.update(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.reconnect_attempts = 0;
            s.degraded = false;
        });
        info!("Real-time channel disconnected");
    }

    /// Send a control message. A no-op with a warning while not connected.
    /// Returns whether the frame was handed to the transport.
    pub async fn emit(&self, event: ClientEvent) -> bool {
        self.shared.emit(event).await
    }

    /// Ask the server for a feed; remembered and re-sent after every reconnect.
    pub async fn request_feed(&self, feed: Feed) -> bool {
        self.shared.feeds.write().await.insert(feed);
        if self.state().status != ConnectionStatus::Connected {
            debug!("Feed {:?} queued until connected", feed);
            return false;
        }
        self.shared.emit(feed.request()).await
    }

    pub async fn release_feed(&self, feed: Feed) -> bool {
        if !self.shared.feeds.write().await.remove(&feed) {
            return false;
        }
        if self.state().status != ConnectionStatus::Connected {
            return false;
        }
        self.shared.emit(ClientEvent::Unsubscribe { topic: feed.topic() }).await
    }
}

impl Shared {
    fn update(&self, apply: impl FnOnce(&mut SessionState)) {
        self.state.send_modify(apply);
    }

    async fn emit(&self, event: ClientEvent) -> bool {
        let sender = self.outbound.read().await.clone();
        let connected = self.state.borrow().status == ConnectionStatus::Connected;
        let Some(sender) = sender.filter(|_| connected) else {
            warn!("Dropping {} message: real-time channel not connected", event.topic_name());
            return false;
        };

        let frame = match envelope::encode_client(&event, Utc::now()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode {} message: {}", event.topic_name(), e);
                return false;
            }
        };

        if sender.send(frame).await.is_err() {
            warn!("Dropping {} message: transport closed", event.topic_name());
            return false;
        }
        true
    }

    async fn run(self: Arc<Self>, url: Url, mut shutdown: oneshot::Receiver<()>) {
        let mut attempts: u32 = 0;

        loop {
            self.update(|s| {
                s.status = ConnectionStatus::Connecting;
                s.reconnect_attempts = attempts;
            });

            let opened = tokio::select! {
                opened = self.transport.open(&url) => opened,
                _ = &mut shutdown => return,
            };

            match opened {
                Ok(channel) => {
                    self.update(|s| {
                        s.status = ConnectionStatus::Connected;
                        s.degraded = false;
                    });
                    info!("Real-time channel connected to {}", url);

                    let connected_at = Instant::now();
                    match self.run_session(channel, &mut shutdown).await {
                        SessionEnd::Shutdown => return,
                        SessionEnd::Closed => debug!("Real-time transport closed"),
                        SessionEnd::Stale => warn!(
                            "No server message within {:?}; treating connection as stale",
                            self.heartbeat_interval * 3
                        ),
                    }

                    // A session that drops before its first heartbeat counts as a failed attempt.
                    if connected_at.elapsed() >= self.heartbeat_interval {
                        attempts = 0;
                    }
                }
                Err(e) => debug!("Real-time transport unavailable: {}", e),
            }

            attempts = attempts.saturating_add(1);
            let Some(delay) = self.backoff.delay_for(attempts) else {
                self.update(|s| {
                    s.status = ConnectionStatus::Disconnected;
                    s.degraded = true;
                });
                warn!(
                    "Real-time channel unavailable after {} reconnection attempts; running in degraded mode",
                    attempts - 1
                );
                return;
            };

            self.update(|s| {
                s.status = ConnectionStatus::Disconnected;
                s.reconnect_attempts = attempts;
            });
            debug!("Reconnecting in {:?} (attempt {})", delay, attempts);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => return,
            }
        }
    }

    async fn run_session(
        &self,
        channel: TransportChannel,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> SessionEnd {
        let TransportChannel { outbound, mut inbound } = channel;
        *self.outbound.write().await = Some(outbound);

        let feeds: Vec<Feed> = self.feeds.read().await.iter().copied().collect();
        for feed in feeds {
            self.emit(feed.request()).await;
        }

        let period = self.heartbeat_interval;
        let stale_after = period * 3;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        let mut last_seen = Instant::now();

        let end = loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => {
                        last_seen = Instant::now();
                        self.handle_frame(&frame);
                    }
                    None => break SessionEnd::Closed,
                },
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() >= stale_after {
                        break SessionEnd::Stale;
                    }
                    self.update(|s| s.reconnect_attempts = 0);
                    if !self.emit(ClientEvent::Heartbeat).await {
                        break SessionEnd::Closed;
                    }
                }
                _ = &mut *shutdown => break SessionEnd::Shutdown,
            }
        };

        // Dropping the last sender closes the transport.
        *self.outbound.write().await = None;
        end
    }

    fn handle_frame(&self, frame: &str) {
        let received_at = Utc::now();
        let envelope = match envelope::decode(frame, received_at) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                return;
            }
        };

        if envelope.topic() == Topic::Heartbeat {
            self.update(|s| s.last_heartbeat_at = Some(received_at));
        }

        let delivered = self.registry.dispatch(Arc::new(envelope));
        tracing::trace!("Frame fanned out to {} subscribers", delivered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::event_transport::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::mpsc;

    struct Peer {
        to_client: mpsc::Sender<String>,
        from_client: mpsc::Receiver<String>,
    }

    struct FakeTransport {
        opens: AtomicU32,
        refuse: AtomicBool,
        peers: mpsc::UnboundedSender<Peer>,
    }

    impl FakeTransport {
        fn new(refuse: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
            let (peers, rx) = mpsc::unbounded_channel();
            let transport = Arc::new(Self {
                opens: AtomicU32::new(0),
                refuse: AtomicBool::new(refuse),
                peers,
            });
            (transport, rx)
        }

        fn opens(&self) -> u32 {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventTransport for FakeTransport {
        async fn open(&self, endpoint: &Url) -> Result<TransportChannel, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            let (outbound, from_client) = mpsc::channel(64);
            let (to_client, inbound) = mpsc::channel(64);
            let _ = self.peers.send(Peer { to_client, from_client });
            Ok(TransportChannel { outbound, inbound })
        }
    }

    fn settings(endpoint: Endpoint, max_attempts: u32) -> ConnectionSettings {
        ConnectionSettings {
            endpoint,
            heartbeat_interval: Duration::from_secs(10),
            backoff: BackoffPolicy::new(
                Duration::from_secs(1),
                2.0,
                Duration::from_secs(8),
                max_attempts,
            ),
        }
    }

    fn ready() -> Endpoint {
        Endpoint::Ready(Url::parse("ws://localhost:9000/events").unwrap())
    }

    fn manager(endpoint: Endpoint, transport: Arc<FakeTransport>, max_attempts: u32) -> ConnectionManager {
        ConnectionManager::new(
            settings(endpoint, max_attempts),
            transport,
            Arc::new(SubscriptionRegistry::new()),
        )
    }

    async fn wait_for(manager: &ConnectionManager, check: impl Fn(&SessionState) -> bool) -> SessionState {
        let mut rx = manager.watch();
        let state = rx.wait_for(|s| check(s)).await.unwrap().clone();
        state
    }

    #[test]
    fn test_endpoint_resolution() {
        assert_eq!(Endpoint::resolve(true, None), Endpoint::Disabled);
        assert_eq!(Endpoint::resolve(true, Some("  ")), Endpoint::Disabled);
        assert_eq!(Endpoint::resolve(false, Some("ws://host/ws")), Endpoint::Disabled);
        assert!(matches!(Endpoint::resolve(true, Some("wss://host/ws")), Endpoint::Ready(_)));
        assert!(matches!(Endpoint::resolve(true, Some("http://host/ws")), Endpoint::Invalid(_)));
        assert!(matches!(Endpoint::resolve(true, Some("not a url")), Endpoint::Invalid(_)));
    }

    #[tokio::test]
    async fn test_disabled_endpoint_never_connects() {
        let (transport, _peers) = FakeTransport::new(false);
        let manager = manager(Endpoint::Disabled, transport.clone(), 3);

        manager.connect().await;
        tokio::task::yield_now().await;

        assert_eq!(manager.state(), SessionState::default());
        assert_eq!(transport.opens(), 0);
        assert!(!manager.emit(ClientEvent::Heartbeat).await);
    }

    #[tokio::test]
    async fn test_invalid_endpoint_reports_error() {
        let (transport, _peers) = FakeTransport::new(false);
        let manager = manager(Endpoint::Invalid("bad scheme".to_string()), transport.clone(), 3);

        manager.connect().await;

        assert_eq!(manager.state().status, ConnectionStatus::Error);
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_subscribers() {
        let (transport, mut peers) = FakeTransport::new(false);
        let registry = Arc::new(SubscriptionRegistry::new());
        let manager = ConnectionManager::new(settings(ready(), 3), transport, registry.clone());
        let (_, mut alerts) = registry.subscribe_channel(Topic::SystemAlert);

        manager.connect().await;
        let peer = peers.recv().await.unwrap();
        wait_for(&manager, |s| s.status == ConnectionStatus::Connected).await;

        peer.to_client.send("garbage".to_string()).await.unwrap();
        peer.to_client
            .send(r#"{"topic":"system_alert","payload":{"severity":"warning","message":"lag"}}"#.to_string())
            .await
            .unwrap();

        let envelope = alerts.recv().await.unwrap();
        assert_eq!(envelope.topic(), Topic::SystemAlert);

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_unfamiliar_payload_shapes_are_dispatched() {
        let (transport, mut peers) = FakeTransport::new(false);
        let registry = Arc::new(SubscriptionRegistry::new());
        let manager = ConnectionManager::new(settings(ready(), 3), transport, registry.clone());
        let (_, mut market) = registry.subscribe_channel(Topic::MarketData);
        let (_, mut alerts) = registry.subscribe_channel(Topic::SystemAlert);

        manager.connect().await;
        let peer = peers.recv().await.unwrap();
        wait_for(&manager, |s| s.status == ConnectionStatus::Connected).await;

        for frame in [
            r#"{"topic":"market_data","payload":{"symbol":"NSE","price":"42.5"}}"#,
            r#"{"topic":"market_data","payload":[1,2,3]}"#,
            r#"{"topic":"system_alert","payload":{"severity":"error","message":"disk"}}"#,
        ] {
            peer.to_client.send(frame.to_string()).await.unwrap();
        }

        let first = market.recv().await.unwrap();
        assert_eq!(first.payload()["symbol"], "NSE");
        assert!(first.market_tick().is_err());
        assert!(market.recv().await.unwrap().payload().is_array());
        assert_eq!(alerts.recv().await.unwrap().payload()["severity"], "error");

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_emit_only_while_connected() {
        let (transport, mut peers) = FakeTransport::new(false);
        let manager = manager(ready(), transport, 3);

        assert!(!manager.emit(ClientEvent::SubscribeBids).await);

        manager.connect().await;
        let mut peer = peers.recv().await.unwrap();
        wait_for(&manager, |s| s.status == ConnectionStatus::Connected).await;

        assert!(manager.emit(ClientEvent::SubscribeBids).await);
        let frame = peer.from_client.recv().await.unwrap();
        assert!(frame.contains(r#""topic":"subscribe_bids""#));

        manager.disconnect().await;
        assert!(!manager.emit(ClientEvent::SubscribeBids).await);
    }

    #[tokio::test]
    async fn test_feeds_replayed_after_connect() {
        let (transport, mut peers) = FakeTransport::new(false);
        let manager = manager(ready(), transport, 3);

        assert!(!manager.request_feed(Feed::Market).await);
        manager.connect().await;

        let mut peer = peers.recv().await.unwrap();
        let frame = peer.from_client.recv().await.unwrap();
        assert!(frame.contains(r#""topic":"subscribe_market""#));

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_sent_and_server_heartbeat_recorded() {
        let (transport, mut peers) = FakeTransport::new(false);
        let manager = manager(ready(), transport, 3);

        manager.connect().await;
        let mut peer = peers.recv().await.unwrap();

        let frame = peer.from_client.recv().await.unwrap();
        assert!(frame.contains(r#""topic":"heartbeat""#));

        peer.to_client.send(r#"{"topic":"heartbeat","payload":{"seq":1}}"#.to_string()).await.unwrap();
        let state = wait_for(&manager, |s| s.last_heartbeat_at.is_some()).await;
        assert_eq!(state.status, ConnectionStatus::Connected);

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_forces_reconnect() {
        let (transport, mut peers) = FakeTransport::new(false);
        let manager = manager(ready(), transport.clone(), 3);

        manager.connect().await;
        let _first = peers.recv().await.unwrap();

        // Three heartbeat periods without any server frame.
        let _second = peers.recv().await.unwrap();
        assert_eq!(transport.opens(), 2);
        wait_for(&manager, |s| s.status == ConnectionStatus::Connected).await;

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_into_degraded_mode() {
        let (transport, _peers) = FakeTransport::new(true);
        let manager = manager(ready(), transport.clone(), 3);

        manager.connect().await;
        let state = wait_for(&manager, |s| s.degraded).await;

        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert_eq!(state.reconnect_attempts, 3);
        assert_eq!(transport.opens(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let (transport, mut peers) = FakeTransport::new(true);
        let manager = manager(ready(), transport.clone(), 5);

        manager.connect().await;
        wait_for(&manager, |s| s.reconnect_attempts == 2).await;
        transport.refuse.store(false, Ordering::SeqCst);

        let _peer = peers.recv().await.unwrap();
        let state = wait_for(&manager, |s| s.status == ConnectionStatus::Connected).await;
        assert_eq!(state.reconnect_attempts, 2);
        assert!(!state.degraded);

        // The counter clears once the session outlives one heartbeat interval.
        let state = wait_for(&manager, |s| s.reconnect_attempts == 0).await;
        assert_eq!(state.status, ConnectionStatus::Connected);

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_closing_on_arrival_still_degrades() {
        let (transport, mut peers) = FakeTransport::new(false);
        let manager = manager(ready(), transport.clone(), 3);
        tokio::spawn(async move {
            while let Some(peer) = peers.recv().await {
                drop(peer);
            }
        });

        manager.connect().await;
        let state = wait_for(&manager, |s| s.degraded).await;

        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert_eq!(state.reconnect_attempts, 3);
        assert_eq!(transport.opens(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let (transport, _peers) = FakeTransport::new(true);
        let manager = manager(ready(), transport.clone(), 10);

        manager.connect().await;
        wait_for(&manager, |s| s.reconnect_attempts == 1).await;
        manager.disconnect().await;
        let opens = transport.opens();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.opens(), opens);
        assert_eq!(manager.state().status, ConnectionStatus::Disconnected);
    }
}
