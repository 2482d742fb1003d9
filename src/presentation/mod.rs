// Presentation layer - HTTP sidecar over a sync session
pub mod app_state;
pub mod handlers;
