//! Save-time preferences.
//!
//! The shell owns preference storage and editing; the engine only needs
//! the save-relevant slice at the moment a map is written out, fetched
//! fresh through a [`PreferencesProvider`] so mid-session changes apply
//! to the next save.

use serde::{Deserialize, Serialize};

/// Which layout to write a map in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapSaveMode {
    /// Keep the layout the file had when it was opened
    #[default]
    Provided,
    /// Always write the classic BYOND layout
    Byond,
    /// Always write the TGM layout
    Tgm,
}

/// The save-relevant preference slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SavePreferences {
    /// Layout to write
    pub save_mode: MapSaveMode,
    /// Drop variable overrides that restate the environment's initial values
    pub sanitize_initial_vars: bool,
    /// Drop tile definitions no grid cell references
    pub clean_unused_keys: bool,
}

/// Source of the current save preferences.
///
/// The shell implements this over its settings store; tests hand in a
/// fixed value.
pub trait PreferencesProvider: Send + Sync {
    /// Preferences to apply to the next save
    fn save_preferences(&self) -> SavePreferences;
}

/// A fixed set of preferences is itself a provider
impl PreferencesProvider for SavePreferences {
    fn save_preferences(&self) -> SavePreferences {
        *self
    }
}
