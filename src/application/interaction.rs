// Interaction classifier - keeps non-modifying UI signals away from the widget store
use crate::application::widget_store::WidgetCommand;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A raw signal coming from the dashboard UI.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum UiSignal {
    Scroll { top: u32, left: u32 },
    Hover { target: Option<String> },
    Focus { target: String },
    Blur,
    MouseMove { x: i32, y: i32 },
    Modal { modal: String, open: bool },
    Command(WidgetCommand),
}

/// Signals that may only touch [`UiState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransientSignal {
    Scroll { top: u32, left: u32 },
    Hover { target: Option<String> },
    Focus { target: String },
    Blur,
    MouseMove { x: i32, y: i32 },
    Modal { modal: String, open: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Transient(TransientSignal),
    Mutation(WidgetCommand),
}

/// Returned by every transient handler. It carries nothing that could reach
/// the widget store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoDashboardEffect;

pub fn classify(signal: UiSignal) -> Route {
    let transient = match signal {
        UiSignal::Command(command) => return Route::Mutation(command),
        UiSignal::Scroll { top, left } => TransientSignal::Scroll { top, left },
        UiSignal::Hover { target } => TransientSignal::Hover { target },
        UiSignal::Focus { target } => TransientSignal::Focus { target },
        UiSignal::Blur => TransientSignal::Blur,
        UiSignal::MouseMove { x, y } => TransientSignal::MouseMove { x, y },
        UiSignal::Modal { modal, open } => TransientSignal::Modal { modal, open },
    };
    Route::Transient(transient)
}

/// View state that lives outside the dashboard: scroll offset, pointer and
/// focus tracking, open modals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub scroll_top: u32,
    pub scroll_left: u32,
    pub hovered: Option<String>,
    pub focused: Option<String>,
    pub pointer: Option<(i32, i32)>,
    pub open_modals: BTreeSet<String>,
}

impl UiState {
    pub fn apply(&mut self, signal: TransientSignal) -> NoDashboardEffect {
        match signal {
            TransientSignal::Scroll { top, left } => {
                self.scroll_top = top;
                self.scroll_left = left;
            }
            TransientSignal::Hover { target } => self.hovered = target,
            TransientSignal::Focus { target } => self.focused = Some(target),
            TransientSignal::Blur => self.focused = None,
            TransientSignal::MouseMove { x, y } => self.pointer = Some((x, y)),
            TransientSignal::Modal { modal, open } => {
                if open {
                    self.open_modals.insert(modal);
                } else {
                    self.open_modals.remove(&modal);
                }
            }
        }
        NoDashboardEffect
    }
}
