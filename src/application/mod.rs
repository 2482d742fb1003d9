// Application layer - Session services and the seams they depend on
pub mod backoff;
pub mod connection_manager;
pub mod event_transport;
pub mod interaction;
pub mod persistence_gateway;
pub mod session;
pub mod subscription_registry;
pub mod widget_repository;
pub mod widget_store;
