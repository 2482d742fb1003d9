// Persistence gateway - bridges store commands to the backend widget collection
use crate::application::widget_repository::{PersistenceError, WidgetRepository};
use crate::application::widget_store::{self, SharedStore};
use crate::domain::widget::{ServerStamp, StoredWidget, SyncState, Widget, WidgetSpec};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct PersistenceGateway {
    repository: Arc<dyn WidgetRepository>,
    store: SharedStore,
    closed: Arc<AtomicBool>,
}

impl PersistenceGateway {
    pub fn new(repository: Arc<dyn WidgetRepository>, store: SharedStore, closed: Arc<AtomicBool>) -> Self {
        Self {
            repository,
            store,
            closed,
        }
    }

    /// Persist a new widget.
    ///
    /// The widget is visible locally as a pending entry while the request is in
    /// flight. On success the server fields are overlaid on that entry; on
    /// failure, or if the session closes meanwhile, the entry is removed again.
    pub async fn create(&self, spec: WidgetSpec) -> Result<StoredWidget, PersistenceError> {
        if self.is_closed() {
            return Err(PersistenceError::SessionClosed);
        }

        let key = widget_store::lock(&self.store)
            .add_widget(spec.clone())
            .map_err(|e| match e {
                widget_store::StoreError::Validation(v) => PersistenceError::Validation(v),
                other => PersistenceError::MalformedResponse(other.to_string()),
            })?;

        let confirmed = self
            .repository
            .create(&spec)
            .await
            .and_then(|response| {
                ServerStamp::from_response(&response)
                    .map(|stamp| (response, stamp))
                    .ok_or_else(|| PersistenceError::MalformedResponse("missing widget id".to_string()))
            });

        if self.is_closed() {
            let _ = widget_store::lock(&self.store).remove_widget(key);
            debug!(%key, "Discarding create result for closed session");
            return Err(PersistenceError::SessionClosed);
        }

        let (response, stamp) = match confirmed {
            Ok(confirmed) => confirmed,
            Err(e) => {
                let _ = widget_store::lock(&self.store).remove_widget(key);
                warn!(%key, "Widget create failed, rolled back: {}", e);
                return Err(e);
            }
        };

        if response.spec != spec {
            warn!(id = %stamp.id, "Backend echo differs from submitted configuration; keeping local configuration");
        }

        let stored = widget_store::lock(&self.store).confirm(key, stamp.clone(), &spec);
        info!(id = %stamp.id, "Widget persisted");

        // Removed locally while the request was in flight: report what the server holds.
        Ok(stored.unwrap_or_else(|| StoredWidget {
            key,
            sync: SyncState::Confirmed,
            widget: Widget {
                id: Some(stamp.id),
                spec,
                audit: stamp.audit,
            },
        }))
    }

    pub async fn list(&self) -> Result<Vec<Widget>, PersistenceError> {
        self.repository.list().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Widget>, PersistenceError> {
        self.repository.get(id).await
    }

    /// Add every backend widget not yet present locally as a confirmed entry.
    /// Returns how many entries were added.
    pub async fn hydrate(&self) -> Result<usize, PersistenceError> {
        if self.is_closed() {
            return Err(PersistenceError::SessionClosed);
        }

        let remote = self.repository.list().await?;
        if self.is_closed() {
            return Err(PersistenceError::SessionClosed);
        }

        let mut store = widget_store::lock(&self.store);
        let mut added = 0;
        for widget in remote {
            let Some(stamp) = ServerStamp::from_response(&widget) else {
                warn!("Skipping backend widget without id");
                continue;
            };
            if store.find_by_server_id(&stamp.id).is_some() {
                continue;
            }
            match store.add_widget(widget.spec.clone()) {
                Ok(key) => {
                    store.confirm(key, stamp, &widget.spec);
                    added += 1;
                }
                Err(e) => warn!(id = %stamp.id, "Skipping invalid backend widget: {}", e),
            }
        }

        debug!("Hydrated {} widgets from backend", added);
        Ok(added)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::widget_repository::MockWidgetRepository;
    use crate::application::widget_store::WidgetStore;
    use crate::domain::widget::{AuditInfo, Position, ValidationError, WidgetKind};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn spec() -> WidgetSpec {
        WidgetSpec::new(WidgetKind::market_prices(), "Prices", Position::new(0, 0, 4, 2))
            .with_config("refresh", "30s")
    }

    fn echo(spec: &WidgetSpec, id: &str) -> Widget {
        Widget {
            id: Some(id.to_string()),
            spec: spec.clone(),
            audit: AuditInfo {
                is_shared: false,
                created_by: Some("trader".to_string()),
                created_at: Some(Utc::now()),
                updated_at: Some(Utc::now()),
            },
        }
    }

    fn gateway(repository: MockWidgetRepository) -> (PersistenceGateway, SharedStore, Arc<AtomicBool>) {
        gateway_over(Arc::new(repository))
    }

    fn gateway_over(repository: Arc<dyn WidgetRepository>) -> (PersistenceGateway, SharedStore, Arc<AtomicBool>) {
        let store: SharedStore = Arc::new(Mutex::new(WidgetStore::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let gateway = PersistenceGateway::new(repository, store.clone(), closed.clone());
        (gateway, store, closed)
    }

    /// Holds every create until the test releases it.
    #[derive(Default)]
    struct GatedRepository {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl WidgetRepository for GatedRepository {
        async fn create(&self, spec: &WidgetSpec) -> Result<Widget, PersistenceError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(echo(spec, "w-9"))
        }

        async fn list(&self) -> Result<Vec<Widget>, PersistenceError> {
            Ok(Vec::new())
        }

        async fn get(&self, _id: &str) -> Result<Option<Widget>, PersistenceError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_create_confirms_optimistic_entry() {
        let mut repository = MockWidgetRepository::new();
        repository
            .expect_create()
            .times(1)
            .returning(|spec| Ok(echo(spec, "w-1")));
        let (gateway, store, _) = gateway(repository);

        let stored = gateway.create(spec()).await.unwrap();

        assert_eq!(stored.sync, SyncState::Confirmed);
        assert_eq!(stored.widget.id.as_deref(), Some("w-1"));
        assert_eq!(stored.widget.spec, spec());
        assert_eq!(widget_store::lock(&store).widgets(), vec![stored]);
    }

    #[tokio::test]
    async fn test_failed_create_rolls_back() {
        let mut repository = MockWidgetRepository::new();
        repository
            .expect_create()
            .returning(|_| Err(PersistenceError::Unreachable("connection refused".to_string())));
        let (gateway, store, _) = gateway(repository);

        let err = gateway.create(spec()).await.unwrap_err();

        assert!(matches!(err, PersistenceError::Unreachable(_)));
        assert!(widget_store::lock(&store).is_empty());
    }

    #[tokio::test]
    async fn test_response_without_id_rolls_back() {
        let mut repository = MockWidgetRepository::new();
        repository
            .expect_create()
            .returning(|spec| Ok(Widget::unsaved(spec.clone())));
        let (gateway, store, _) = gateway(repository);

        let err = gateway.create(spec()).await.unwrap_err();

        assert!(matches!(err, PersistenceError::MalformedResponse(_)));
        assert!(widget_store::lock(&store).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_spec_never_reaches_backend() {
        let mut repository = MockWidgetRepository::new();
        repository.expect_create().never();
        let (gateway, store, _) = gateway(repository);

        let mut bad = spec();
        bad.position.w = 0;
        let err = gateway.create(bad).await.unwrap_err();

        assert!(matches!(err, PersistenceError::Validation(ValidationError::EmptySpan { .. })));
        assert!(widget_store::lock(&store).is_empty());
    }

    #[tokio::test]
    async fn test_echo_mismatch_keeps_local_configuration() {
        let mut repository = MockWidgetRepository::new();
        repository.expect_create().returning(|spec| {
            let mut widget = echo(spec, "w-2");
            widget.spec.title = "Renamed by server".to_string();
            Ok(widget)
        });
        let (gateway, _, _) = gateway(repository);

        let stored = gateway.create(spec()).await.unwrap();
        assert_eq!(stored.widget.spec.title, "Prices");
    }

    #[tokio::test]
    async fn test_closed_gateway_never_reaches_backend() {
        let mut repository = MockWidgetRepository::new();
        repository.expect_create().never();
        repository.expect_list().never();
        let (gateway, store, closed) = gateway(repository);
        closed.store(true, Ordering::SeqCst);

        assert!(matches!(gateway.create(spec()).await, Err(PersistenceError::SessionClosed)));
        assert!(matches!(gateway.hydrate().await, Err(PersistenceError::SessionClosed)));
        assert!(widget_store::lock(&store).is_empty());
    }

    #[tokio::test]
    async fn test_close_during_create_removes_pending_entry() {
        let repository = Arc::new(GatedRepository::default());
        let (gateway, store, closed) = gateway_over(repository.clone());

        let task = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.create(spec()).await }
        });
        repository.entered.notified().await;
        assert_eq!(widget_store::lock(&store).len(), 1);

        closed.store(true, Ordering::SeqCst);
        repository.release.notify_one();

        assert!(matches!(task.await.unwrap(), Err(PersistenceError::SessionClosed)));
        assert!(widget_store::lock(&store).is_empty());
    }

    #[tokio::test]
    async fn test_edit_during_create_is_not_confirmed() {
        let repository = Arc::new(GatedRepository::default());
        let (gateway, store, _) = gateway_over(repository.clone());

        let task = tokio::spawn({
            let gateway = gateway.clone();
            async move { gateway.create(spec()).await }
        });
        repository.entered.notified().await;
        let key = widget_store::lock(&store).widgets()[0].key;
        widget_store::lock(&store)
            .move_widget(key, Position::new(8, 8, 4, 2))
            .unwrap();
        repository.release.notify_one();

        let stored = task.await.unwrap().unwrap();
        assert_eq!(stored.sync, SyncState::Modified);
        assert_eq!(stored.widget.id.as_deref(), Some("w-9"));
        assert_eq!(stored.widget.spec.position, Position::new(8, 8, 4, 2));
        assert_eq!(widget_store::lock(&store).get(key), Some(stored));
    }

    #[tokio::test]
    async fn test_hydrate_adds_missing_widgets_once() {
        let mut repository = MockWidgetRepository::new();
        repository
            .expect_list()
            .times(2)
            .returning(|| Ok(vec![echo(&spec(), "w-1"), Widget::unsaved(spec())]));
        let (gateway, store, _) = gateway(repository);

        assert_eq!(gateway.hydrate().await.unwrap(), 1);
        assert_eq!(gateway.hydrate().await.unwrap(), 0);

        let widgets = widget_store::lock(&store).widgets();
        assert_eq!(widgets.len(), 1);
        assert_eq!(widgets[0].sync, SyncState::Confirmed);
    }
}
