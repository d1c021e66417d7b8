//! Configuration file support for trapwm.
//!
//! Loads settings from ~/.config/trapwm/config.toml if it exists,
//! otherwise uses sensible defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// Top-level configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub policy: PolicyConfig,
    pub bar: BarConfig,
    pub input: InputConfig,
    pub keybindings: KeybindingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            policy: PolicyConfig::default(),
            bar: BarConfig::default(),
            input: InputConfig::default(),
            keybindings: KeybindingConfig::default(),
        }
    }
}

/// General settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Terminal emulator spawned by the default `c` binding
    pub terminal: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { terminal: "xterm".to_string() }
    }
}

/// Rudeness levels: whether newly-mapped or raise-requesting windows may
/// seize focus automatically or merely notify the user. The four flags are
/// fully independent; no precedence between them is inferred.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Honour the first map request of a never-focused transient window
    pub honour_transient_map: bool,
    /// Honour the first map request of a never-focused normal window
    pub honour_normal_map: bool,
    /// Honour raise requests from transient windows
    pub honour_transient_raise: bool,
    /// Honour raise requests from normal windows
    pub honour_normal_raise: bool,
    /// Treat windows whose maximum size is smaller than the screen like
    /// transients when deciding whether other windows stay visible
    pub undersized_windows_share: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            honour_transient_map: true,
            honour_normal_map: true,
            honour_transient_raise: false,
            honour_normal_raise: false,
            undersized_windows_share: false,
        }
    }
}

/// Message bar settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BarConfig {
    /// Seconds before a message auto-hides; zero or negative disables the
    /// timer
    pub timeout: i64,
}

impl Default for BarConfig {
    fn default() -> Self {
        Self { timeout: 5 }
    }
}

/// Prefix key and command-mode settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// The prefix key, e.g. "C-t"
    pub prefix: String,
    /// Show a dedicated cursor while waiting for the command keystroke
    pub wait_for_key_cursor: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            prefix: "C-t".to_string(),
            wait_for_key_cursor: true,
        }
    }
}

/// Keybindings (key spec -> command line), merged over the defaults
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct KeybindingConfig {
    #[serde(flatten)]
    pub bindings: HashMap<String, String>,
}

impl Config {
    /// Path to the user config file
    fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("trapwm").join("config.toml"))
    }

    /// Load the user configuration, falling back to defaults on any error.
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            return Self::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
