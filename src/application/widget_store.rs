// Widget state store - the single mutation authority for a dashboard's widgets
use crate::domain::widget::{
    validate_config, Position, ServerStamp, StoredWidget, SyncState, ValidationError, Widget,
    WidgetConfig, WidgetKey, WidgetSpec,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// A session's store. The lock is never held across an await point.
pub type SharedStore = Arc<Mutex<WidgetStore>>;

pub(crate) fn lock(store: &Mutex<WidgetStore>) -> MutexGuard<'_, WidgetStore> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no widget with key {0}")]
    NotFound(WidgetKey),
}

/// The complete set of mutations the store accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WidgetCommand {
    Add { widget: WidgetSpec },
    Move { key: WidgetKey, position: Position },
    Resize { key: WidgetKey, position: Position },
    Remove { key: WidgetKey },
    UpdateConfig { key: WidgetKey, config: WidgetConfig },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Added { key: WidgetKey },
    Updated { widget: StoredWidget },
    Removed { widget: StoredWidget },
}

/// Ordered widget list of one dashboard session.
///
/// Each command validates first and mutates second, so a rejected command
/// leaves the list exactly as it was. Reads hand out owned copies.
#[derive(Debug, Default)]
pub struct WidgetStore {
    widgets: Vec<StoredWidget>,
}

impl WidgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, command: WidgetCommand) -> Result<CommandOutcome, StoreError> {
        match command {
            WidgetCommand::Add { widget } => {
                self.add_widget(widget).map(|key| CommandOutcome::Added { key })
            }
            WidgetCommand::Move { key, position } => self
                .move_widget(key, position)
                .map(|widget| CommandOutcome::Updated { widget }),
            WidgetCommand::Resize { key, position } => self
                .resize_widget(key, position)
                .map(|widget| CommandOutcome::Updated { widget }),
            WidgetCommand::Remove { key } => {
                self.remove_widget(key).map(|widget| CommandOutcome::Removed { widget })
            }
            WidgetCommand::UpdateConfig { key, config } => self
                .update_config(key, config)
                .map(|widget| CommandOutcome::Updated { widget }),
        }
    }

    /// Append a widget as a pending entry.
    pub fn add_widget(&mut self, spec: WidgetSpec) -> Result<WidgetKey, StoreError> {
        spec.validate()?;
        let key = WidgetKey::generate();
        self.widgets.push(StoredWidget {
            key,
            sync: SyncState::Pending,
            widget: Widget::unsaved(spec),
        });
        tracing::debug!(%key, "Widget added");
        Ok(key)
    }

    pub fn move_widget(&mut self, key: WidgetKey, position: Position) -> Result<StoredWidget, StoreError> {
        position.validate()?;
        let entry = self.entry_mut(key)?;
        if entry.widget.spec.position != position {
            entry.widget.spec.position = position;
            entry.mark_modified();
        }
        tracing::debug!(%key, %position, "Widget moved");
        Ok(entry.clone())
    }

    pub fn resize_widget(&mut self, key: WidgetKey, position: Position) -> Result<StoredWidget, StoreError> {
        position.validate()?;
        let entry = self.entry_mut(key)?;
        if entry.widget.spec.position != position {
            entry.widget.spec.position = position;
            entry.mark_modified();
        }
        tracing::debug!(%key, %position, "Widget resized");
        Ok(entry.clone())
    }

    pub fn remove_widget(&mut self, key: WidgetKey) -> Result<StoredWidget, StoreError> {
        let index = self.index_of(key)?;
        let removed = self.widgets.remove(index);
        tracing::debug!(%key, "Widget removed");
        Ok(removed)
    }

    pub fn update_config(&mut self, key: WidgetKey, config: WidgetConfig) -> Result<StoredWidget, StoreError> {
        validate_config(&config)?;
        let entry = self.entry_mut(key)?;
        if entry.widget.spec.config != config {
            entry.widget.spec.config = config;
            entry.mark_modified();
        }
        tracing::debug!(%key, "Widget config updated");
        Ok(entry.clone())
    }

    /// Overlay server-generated fields on an entry. Configuration fields are
    /// left untouched; the entry is confirmed only if it still matches the
    /// `submitted` spec, otherwise it is left `Modified`.
    pub(crate) fn confirm(
        &mut self,
        key: WidgetKey,
        stamp: ServerStamp,
        submitted: &WidgetSpec,
    ) -> Option<StoredWidget> {
        let entry = self.widgets.iter_mut().find(|w| w.key == key)?;
        entry.widget.id = Some(stamp.id);
        entry.widget.audit = stamp.audit;
        entry.sync = if entry.widget.spec == *submitted {
            SyncState::Confirmed
        } else {
            tracing::debug!(%key, "Widget edited while its create was in flight");
            SyncState::Modified
        };
        Some(entry.clone())
    }

    /// Owned snapshot of the widget list, in display order.
    pub fn widgets(&self) -> Vec<StoredWidget> {
        self.widgets.clone()
    }

    pub fn get(&self, key: WidgetKey) -> Option<StoredWidget> {
        self.widgets.iter().find(|w| w.key == key).cloned()
    }

    pub fn find_by_server_id(&self, id: &str) -> Option<StoredWidget> {
        self.widgets
            .iter()
            .find(|w| w.widget.id.as_deref() == Some(id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.widgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }

    fn index_of(&self, key: WidgetKey) -> Result<usize, StoreError> {
        self.widgets
            .iter()
            .position(|w| w.key == key)
            .ok_or(StoreError::NotFound(key))
    }

    fn entry_mut(&mut self, key: WidgetKey) -> Result<&mut StoredWidget, StoreError> {
        let index = self.index_of(key)?;
        Ok(&mut self.widgets[index])
    }
}

impl StoredWidget {
    fn mark_modified(&mut self) {
        if self.sync == SyncState::Confirmed {
            self.sync = SyncState::Modified;
        }
    }
}
