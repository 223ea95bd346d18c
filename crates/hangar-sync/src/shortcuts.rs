/// Keyboard routing for undo/redo
use serde::{Deserialize, Serialize};

use crate::HistoryDirection;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChord {
    pub key: String,
    #[serde(default)]
    pub ctrl: bool,
    /// Cmd on macOS.
    #[serde(default)]
    pub meta: bool,
    #[serde(default)]
    pub shift: bool,
}

impl KeyChord {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ctrl: false,
            meta: false,
            shift: false,
        }
    }

    pub fn ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn meta(mut self) -> Self {
        self.meta = true;
        self
    }

    pub fn shift(mut self) -> Self {
        self.shift = true;
        self
    }
}

/// Map a key press to a history command.
///
/// Ctrl/Cmd+Z undoes, Ctrl/Cmd+Y and Ctrl/Cmd+Shift+Z redo. Keys without
/// Ctrl/Cmd are never routed, so typing in a text control passes through.
pub fn history_shortcut(chord: &KeyChord) -> Option<HistoryDirection> {
    if !(chord.ctrl || chord.meta) {
        return None;
    }

    match chord.key.to_ascii_lowercase().as_str() {
        "z" if chord.shift => Some(HistoryDirection::Redo),
        "z" => Some(HistoryDirection::Undo),
        "y" => Some(HistoryDirection::Redo),
        _ => None,
    }
}
