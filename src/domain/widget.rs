// Widget domain model
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Widget kinds the dashboard ships with. Other non-empty kinds are accepted.
pub mod kinds {
    pub const ENERGY_GENERATION_CHART: &str = "energy-generation-chart";
    pub const MARKET_PRICES: &str = "market-prices";
    pub const ASSET_STATUS: &str = "asset-status";
    pub const BID_STATUS: &str = "bid-status";
    pub const SYSTEM_ALERTS: &str = "system-alerts";

    pub const KNOWN: [&str; 5] = [
        ENERGY_GENERATION_CHART,
        MARKET_PRICES,
        ASSET_STATUS,
        BID_STATUS,
        SYSTEM_ALERTS,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("widget type must not be empty")]
    EmptyType,

    #[error("widget title must not be empty")]
    EmptyTitle,

    #[error("widget span must be at least 1x1, got {w}x{h}")]
    EmptySpan { w: u32, h: u32 },

    #[error("widget position overflows the grid: {0}")]
    PositionOverflow(Position),

    #[error("config keys must not be empty")]
    EmptyConfigKey,

    #[error("backend rejected widget: {reason}")]
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WidgetKind(String);

impl WidgetKind {
    pub fn parse(kind: impl Into<String>) -> Result<Self, ValidationError> {
        let kind = kind.into();
        if kind.trim().is_empty() {
            return Err(ValidationError::EmptyType);
        }
        Ok(Self(kind))
    }

    pub fn market_prices() -> Self {
        Self(kinds::MARKET_PRICES.to_string())
    }

    pub fn asset_status() -> Self {
        Self(kinds::ASSET_STATUS.to_string())
    }

    pub fn energy_generation_chart() -> Self {
        Self(kinds::ENERGY_GENERATION_CHART.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_known(&self) -> bool {
        kinds::KNOWN.contains(&self.0.as_str())
    }
}

impl TryFrom<String> for WidgetKind {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<WidgetKind> for String {
    fn from(kind: WidgetKind) -> Self {
        kind.0
    }
}

impl fmt::Display for WidgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Grid placement. Unsigned fields make negative coordinates unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Position {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.w == 0 || self.h == 0 {
            return Err(ValidationError::EmptySpan { w: self.w, h: self.h });
        }
        if self.x.checked_add(self.w).is_none() || self.y.checked_add(self.h).is_none() {
            return Err(ValidationError::PositionOverflow(*self));
        }
        Ok(())
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}) {}x{}", self.x, self.y, self.w, self.h)
    }
}

/// A scalar config value. Objects and arrays are rejected at decode time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Text(value.to_string())
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Number(value.into())
    }
}

pub type WidgetConfig = BTreeMap<String, ConfigValue>;

pub fn validate_config(config: &WidgetConfig) -> Result<(), ValidationError> {
    if config.keys().any(|key| key.trim().is_empty()) {
        return Err(ValidationError::EmptyConfigKey);
    }
    Ok(())
}

/// The configuration half of a widget: everything the client owns.
///
/// Derived equality is configuration equality. Permissions are a set, so their
/// order never matters, and server fields live elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSpec {
    #[serde(rename = "type")]
    pub kind: WidgetKind,
    pub title: String,
    pub position: Position,
    #[serde(default)]
    pub config: WidgetConfig,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub permissions: BTreeSet<String>,
}

impl WidgetSpec {
    pub fn new(kind: WidgetKind, title: impl Into<String>, position: Position) -> Self {
        Self {
            kind,
            title: title.into(),
            position,
            config: WidgetConfig::new(),
            permissions: BTreeSet::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.kind.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyType);
        }
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        self.position.validate()?;
        validate_config(&self.config)
    }
}

/// Collaboration and audit metadata. Only server confirmation writes these.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditInfo {
    #[serde(default)]
    pub is_shared: bool,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A widget as the backend stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Widget {
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(flatten)]
    pub spec: WidgetSpec,
    #[serde(flatten)]
    pub audit: AuditInfo,
}

impl Widget {
    pub fn unsaved(spec: WidgetSpec) -> Self {
        Self {
            id: None,
            spec,
            audit: AuditInfo::default(),
        }
    }

    pub fn config_eq(&self, other: &Widget) -> bool {
        self.spec == other.spec
    }
}

/// Server-generated fields carried by a create confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStamp {
    pub id: String,
    pub audit: AuditInfo,
}

impl ServerStamp {
    /// Extract the stamp from a backend response. `None` when the id is missing.
    pub fn from_response(widget: &Widget) -> Option<Self> {
        let id = widget.id.as_deref().filter(|id| !id.is_empty())?;
        Some(Self {
            id: id.to_string(),
            audit: widget.audit.clone(),
        })
    }
}

/// Client-side handle for a store entry; never sent to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WidgetKey(Uuid);

impl WidgetKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WidgetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Visible locally, not yet acknowledged by the backend.
    Pending,
    /// Matches what the backend acknowledged.
    Confirmed,
    /// Known to the backend, with local edits it has not seen.
    Modified,
}

/// One entry of the widget store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredWidget {
    pub key: WidgetKey,
    pub sync: SyncState,
    #[serde(flatten)]
    pub widget: Widget,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    }))
}
