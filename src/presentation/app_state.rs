// Application state for HTTP handlers
use crate::application::session::SyncSession;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SyncSession>,
}
