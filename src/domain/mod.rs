// Domain layer - Widgets, dashboards and event envelopes
pub mod dashboard;
pub mod envelope;
pub mod widget;
