//! Local-only interface state. Never leaves the process.

use serde::{Deserialize, Serialize};

use tavern_core::CardId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUiState {
    pub backpack_open: bool,
    pub picker_open: bool,
    pub selected: Option<CardId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiAction {
    ToggleBackpack,
    TogglePicker,
    Select(Option<CardId>),
}

impl LocalUiState {
    /// Apply an action. Returns `true` if anything changed.
    pub fn apply(&mut self, action: UiAction) -> bool {
        match action {
            UiAction::ToggleBackpack => {
                self.backpack_open = !self.backpack_open;
                true
            }
            UiAction::TogglePicker => {
                self.picker_open = !self.picker_open;
                true
            }
            UiAction::Select(selected) => {
                if self.selected == selected {
                    return false;
                }
                self.selected = selected;
                true
            }
        }
    }

    /// Drop a selection that points at a card no longer visible.
    pub fn retain_selection(&mut self, visible: impl Fn(&CardId) -> bool) {
        if self.selected.as_ref().is_some_and(|id| !visible(id)) {
            self.selected = None;
        }
    }
}
