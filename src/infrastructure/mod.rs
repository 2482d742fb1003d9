// Infrastructure layer - External dependencies and adapters
pub mod chunked_stream;
pub mod config;
pub mod http_response;
pub mod http_widget_repository;
pub mod websocket_transport;
