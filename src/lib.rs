// Dashboard sync engine - live event fan-out and widget persistence for dashboard sessions
pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;
