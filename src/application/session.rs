// Sync session - per-dashboard service owning the live channel, fan-out, store and UI state
use crate::application::connection_manager::{
    ConnectionManager, ConnectionSettings, Feed, SessionState,
};
use crate::application::event_transport::EventTransport;
use crate::application::interaction::{self, Route, UiSignal, UiState};
use crate::application::persistence_gateway::PersistenceGateway;
use crate::application::subscription_registry::{SubscriptionId, SubscriptionRegistry};
use crate::application::widget_repository::{PersistenceError, WidgetRepository};
use crate::application::widget_store::{
    self, CommandOutcome, SharedStore, StoreError, WidgetCommand, WidgetStore,
};
use crate::domain::dashboard::{DashboardPreferences, DashboardState};
use crate::domain::envelope::{ClientEvent, Envelope, Topic};
use crate::domain::widget::{StoredWidget, Widget, WidgetSpec};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Everything one dashboard session needs. Sessions never share mutable state.
pub struct SyncSession {
    connection: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
    store: SharedStore,
    gateway: PersistenceGateway,
    ui: Mutex<UiState>,
    preferences: Mutex<DashboardPreferences>,
    closed: Arc<AtomicBool>,
}

impl SyncSession {
    pub fn new(
        settings: ConnectionSettings,
        transport: Arc<dyn EventTransport>,
        repository: Arc<dyn WidgetRepository>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let store: SharedStore = Arc::new(Mutex::new(WidgetStore::new()));
        let closed = Arc::new(AtomicBool::new(false));

        Self {
            connection: ConnectionManager::new(settings, transport, Arc::clone(&registry)),
            gateway: PersistenceGateway::new(repository, Arc::clone(&store), Arc::clone(&closed)),
            registry,
            store,
            ui: Mutex::new(UiState::default()),
            preferences: Mutex::new(DashboardPreferences::default()),
            closed,
        }
    }

    pub async fn connect(&self) {
        if self.is_closed() {
            warn!("Ignoring connect on a closed session");
            return;
        }
        self.connection.connect().await;
    }

    /// Close the live channel only. Subscriber registrations, the widget store
    /// and queued feed requests survive, so a later `connect` resumes delivery
    /// to the same subscribers. Use [`SyncSession::shutdown`] to end the session.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Tear the session down. Every subscriber registration is dropped and no
    /// callback runs afterwards. Persistence calls are refused from here on and
    /// results still in flight are discarded.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connection.disconnect().await;
        self.registry.clear();
        info!("Sync session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        self.connection.state()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.connection.watch()
    }

    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> SubscriptionId
    where
        F: FnMut(&Envelope) -> anyhow::Result<()> + Send + 'static,
    {
        self.registry.subscribe(topic, callback)
    }

    pub fn subscribe_channel(
        &self,
        topic: Topic,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Arc<Envelope>>) {
        self.registry.subscribe_channel(topic)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    pub fn unsubscribe_topic(&self, topic: Topic) -> usize {
        self.registry.unsubscribe_topic(topic)
    }

    pub async fn emit(&self, event: ClientEvent) -> bool {
        self.connection.emit(event).await
    }

    pub async fn request_feed(&self, feed: Feed) -> bool {
        self.connection.request_feed(feed).await
    }

    pub async fn release_feed(&self, feed: Feed) -> bool {
        self.connection.release_feed(feed).await
    }

    pub fn apply(&self, command: WidgetCommand) -> Result<CommandOutcome, StoreError> {
        widget_store::lock(&self.store).apply(command)
    }

    /// Route a UI signal. Transient signals only touch UI state and yield `None`.
    pub fn handle_ui(&self, signal: UiSignal) -> Result<Option<CommandOutcome>, StoreError> {
        match interaction::classify(signal) {
            Route::Transient(signal) => {
                lock(&self.ui).apply(signal);
                Ok(None)
            }
            Route::Mutation(command) => self.apply(command).map(Some),
        }
    }

    pub async fn create_widget(&self, spec: WidgetSpec) -> Result<StoredWidget, PersistenceError> {
        self.gateway.create(spec).await
    }

    pub async fn list_remote(&self) -> Result<Vec<Widget>, PersistenceError> {
        self.gateway.list().await
    }

    pub async fn get_remote(&self, id: &str) -> Result<Option<Widget>, PersistenceError> {
        self.gateway.get(id).await
    }

    pub async fn hydrate(&self) -> Result<usize, PersistenceError> {
        self.gateway.hydrate().await
    }

    pub fn widgets(&self) -> Vec<StoredWidget> {
        widget_store::lock(&self.store).widgets()
    }

    pub fn dashboard(&self) -> DashboardState {
        DashboardState::new(self.widgets(), lock(&self.preferences).clone())
    }

    pub fn set_preferences(&self, preferences: DashboardPreferences) {
        *lock(&self.preferences) = preferences;
    }

    pub fn ui_state(&self) -> UiState {
        lock(&self.ui).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
