// Dashboard domain model
use super::widget::StoredWidget;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    #[default]
    Grid,
    List,
}

/// Per-session display preferences. Held apart from the widget list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardPreferences {
    pub theme: Theme,
    pub layout: Layout,
    pub auto_refresh: bool,
}

impl Default for DashboardPreferences {
    fn default() -> Self {
        Self {
            theme: Theme::default(),
            layout: Layout::default(),
            auto_refresh: true,
        }
    }
}

/// Point-in-time view of a dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardState {
    pub widgets: Vec<StoredWidget>,
    #[serde(flatten)]
    pub preferences: DashboardPreferences,
}

impl DashboardState {
    pub fn new(widgets: Vec<StoredWidget>, preferences: DashboardPreferences) -> Self {
        Self {
            widgets,
            preferences,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dashboard_state_serializes_flat() {
        let state = DashboardState::new(Vec::new(), DashboardPreferences::default());
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({"widgets": [], "theme": "system", "layout": "grid", "autoRefresh": true})
        );
    }
}
