//! Keybindings and the prefix-key command mode.
//!
//! A binding maps (keysym, normalized modifier mask) to a command line. The
//! prefix key switches the manager into a one-keystroke command mode:
//! transient UI is hidden, the auto-hide timer cancelled, keyboard focus is
//! redirected to the screen's key sink for exactly one keystroke, and the
//! result is either a command invocation or an "unbound" notification. Keys
//! that reach the manager without matching the prefix are forwarded to the
//! focused client so the manager stays transparent.

use std::collections::HashMap;

use anyhow::Result;
use once_cell::sync::Lazy;

use crate::config::Config;
use crate::conn::{DisplayConn, KeyInput, Keysym, WindowHandle};
use crate::Wm;

/// X modifier mask bits
pub const MOD_SHIFT: u16 = 1 << 0;
pub const MOD_LOCK: u16 = 1 << 1;
pub const MOD_CONTROL: u16 = 1 << 2;
pub const MOD_META: u16 = 1 << 3; // Mod1
pub const MOD_NUMLOCK: u16 = 1 << 4; // Mod2
pub const MOD_SUPER: u16 = 1 << 6; // Mod4

/// Strip NumLock and CapsLock (and pointer-button bits) so bindings match
/// regardless of lock state.
pub fn normalize_modifiers(state: u16) -> u16 {
    state & !(MOD_NUMLOCK | MOD_LOCK) & 0x00ff
}

/// Keysyms for the named keys the binding parser understands.
static KEYSYM_NAMES: Lazy<HashMap<&'static str, Keysym>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("space", 0x0020);
    m.insert("exclam", 0x0021);
    m.insert("comma", 0x002c);
    m.insert("period", 0x002e);
    m.insert("slash", 0x002f);
    m.insert("semicolon", 0x003b);
    m.insert("colon", 0x003a);
    m.insert("BackSpace", 0xff08);
    m.insert("Tab", 0xff09);
    m.insert("Return", 0xff0d);
    m.insert("Escape", 0xff1b);
    m.insert("Left", 0xff51);
    m.insert("Up", 0xff52);
    m.insert("Right", 0xff53);
    m.insert("Down", 0xff54);
    m.insert("Delete", 0xffff);
    for (i, name) in ["F1", "F2", "F3", "F4", "F5", "F6", "F7", "F8", "F9", "F10", "F11", "F12"]
        .iter()
        .enumerate()
    {
        m.insert(*name, 0xffbe + i as Keysym);
    }
    m
});

/// Parse a key spec like "C-t", "M-Return" or "K" into (keysym, modifiers).
/// Uppercase letters imply Shift with the lowercase keysym, matching how
/// keystrokes are reported at keymap level zero.
pub fn parse_key_spec(spec: &str) -> Option<(Keysym, u16)> {
    let mut modifiers = 0u16;
    let mut rest = spec;
    loop {
        if let Some(stripped) = rest.strip_prefix("C-") {
            modifiers |= MOD_CONTROL;
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix("M-") {
            modifiers |= MOD_META;
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix("S-") {
            modifiers |= MOD_SHIFT;
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix("Super-") {
            modifiers |= MOD_SUPER;
            rest = stripped;
        } else {
            break;
        }
    }
    if rest.is_empty() {
        return None;
    }
    let mut chars = rest.chars();
    let first = chars.next()?;
    if chars.next().is_none() && first.is_ascii() {
        if first.is_ascii_uppercase() {
            return Some((first.to_ascii_lowercase() as Keysym, modifiers | MOD_SHIFT));
        }
        return Some((first as Keysym, modifiers));
    }
    KEYSYM_NAMES.get(rest).map(|&keysym| (keysym, modifiers))
}

/// Human-readable key description for feedback messages.
pub fn describe_key(keysym: Keysym, modifiers: u16) -> String {
    let mut out = String::new();
    if modifiers & MOD_CONTROL != 0 {
        out.push_str("C-");
    }
    if modifiers & MOD_META != 0 {
        out.push_str("M-");
    }
    if modifiers & MOD_SUPER != 0 {
        out.push_str("Super-");
    }
    if modifiers & MOD_SHIFT != 0 {
        out.push_str("S-");
    }
    if (0x21..=0x7e).contains(&keysym) {
        out.push(keysym as u8 as char);
    } else if keysym == 0x20 {
        out.push_str("space");
    } else if let Some(name) = KEYSYM_NAMES.iter().find(|(_, &v)| v == keysym).map(|(n, _)| *n) {
        out.push_str(name);
    } else {
        out.push_str(&format!("0x{:x}", keysym));
    }
    out
}

/// The static binding table consulted during dispatch.
pub struct KeyBindings {
    bindings: HashMap<(Keysym, u16), String>,
    pub prefix: KeyInput,
}

impl KeyBindings {
    /// Defaults merged with (and overridden by) the user's `[keybindings]`
    /// table.
    pub fn from_config(config: &Config) -> Self {
        let mut bindings = HashMap::new();
        let defaults: Vec<(&str, String)> = vec![
            ("c", format!("exec {}", config.general.terminal)),
            ("n", "next".to_string()),
            ("p", "prev".to_string()),
            ("space", "next".to_string()),
            ("w", "windows".to_string()),
            ("o", "focus".to_string()),
            ("Tab", "focus".to_string()),
            ("s", "split".to_string()),
            ("S", "vsplit".to_string()),
            ("Q", "only".to_string()),
            ("R", "remove".to_string()),
            ("k", "delete".to_string()),
            ("K", "kill".to_string()),
            ("f", "curframe".to_string()),
            ("v", "version".to_string()),
        ];
        for (spec, command) in defaults {
            if let Some(key) = parse_key_spec(spec) {
                bindings.insert(key, command);
            }
        }
        for n in 0..=9u32 {
            let spec = n.to_string();
            if let Some(key) = parse_key_spec(&spec) {
                bindings.insert(key, format!("select {}", n));
            }
        }
        for (spec, command) in &config.keybindings.bindings {
            match parse_key_spec(spec) {
                Some(key) => {
                    bindings.insert(key, command.clone());
                }
                None => log::warn!("Ignoring unparseable key spec {:?}", spec),
            }
        }

        let prefix = parse_key_spec(&config.input.prefix).unwrap_or_else(|| {
            log::warn!("Bad prefix key {:?}, falling back to C-t", config.input.prefix);
            parse_key_spec("C-t").unwrap()
        });
        Self {
            bindings,
            prefix: KeyInput { keysym: prefix.0, modifiers: prefix.1, keycode: 0 },
        }
    }

    pub fn lookup(&self, keysym: Keysym, modifiers: u16) -> Option<&str> {
        self.bindings.get(&(keysym, modifiers)).map(|s| s.as_str())
    }

    pub fn is_prefix(&self, keysym: Keysym, modifiers: u16) -> bool {
        keysym == self.prefix.keysym && modifiers == self.prefix.modifiers
    }
}

impl<C: DisplayConn> Wm<C> {
    /// Top-level key press: either enter command mode or forward the
    /// keystroke to whoever holds logical focus.
    pub fn on_key_press(&mut self, root: WindowHandle, key: KeyInput) -> Result<()> {
        let Some(screen) = self.screen_of_root(root) else {
            return Ok(());
        };
        let modifiers = normalize_modifiers(key.modifiers);
        if self.keys.is_prefix(key.keysym, modifiers) {
            self.command_mode(screen)
        } else {
            if let Some(window) = self.current_window {
                self.conn.forward_key(window, key)?;
            }
            Ok(())
        }
    }

    /// The one-keystroke command mode entered by the prefix key.
    fn command_mode(&mut self, screen: usize) -> Result<()> {
        self.hide_transient_ui(screen)?;
        self.timer.cancel();

        let sink = self.screens[screen].key_window;
        let key = self
            .conn
            .wait_for_key(sink, self.config.input.wait_for_key_cursor)?;
        let modifiers = normalize_modifiers(key.modifiers);

        // Prefix twice sends the prefix keystroke through to the client.
        if self.keys.is_prefix(key.keysym, modifiers) {
            if let Some(window) = self.current_window {
                self.conn.forward_key(window, key)?;
            }
            return Ok(());
        }

        let bound = self.keys.lookup(key.keysym, modifiers).map(|s| s.to_string());
        match bound {
            Some(command) => {
                log::debug!("Key {} -> {}", describe_key(key.keysym, modifiers), command);
                if let Some(result) = self.execute_command(&command) {
                    if !result.is_empty() {
                        self.marked_message(screen, &result)?;
                    }
                }
            }
            None => {
                let text = format!("{} is not bound", describe_key(key.keysym, modifiers));
                self.marked_message(screen, &text)?;
            }
        }
        Ok(())
    }

    /// Re-grab the prefix key on every mapped window after the keyboard
    /// mapping table changed system-wide.
    pub fn regrab_prefix_keys(&mut self) -> Result<()> {
        let mapped: Vec<WindowHandle> = self.registry.mapped().map(|w| w.handle).collect();
        for window in &mapped {
            self.conn.ungrab_keys(*window)?;
        }
        self.conn.refresh_keyboard_mapping()?;
        let prefix = self.keys.prefix;
        for window in &mapped {
            self.conn.grab_prefix_key(*window, prefix)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_and_modified() {
        assert_eq!(parse_key_spec("t"), Some(('t' as u32, 0)));
        assert_eq!(parse_key_spec("C-t"), Some(('t' as u32, MOD_CONTROL)));
        assert_eq!(parse_key_spec("M-Return"), Some((0xff0d, MOD_META)));
        assert_eq!(parse_key_spec("C-M-x"), Some(('x' as u32, MOD_CONTROL | MOD_META)));
    }

    #[test]
    fn test_parse_uppercase_implies_shift() {
        assert_eq!(parse_key_spec("K"), Some(('k' as u32, MOD_SHIFT)));
        assert_eq!(parse_key_spec("C-K"), Some(('k' as u32, MOD_CONTROL | MOD_SHIFT)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_key_spec(""), None);
        assert_eq!(parse_key_spec("C-"), None);
        assert_eq!(parse_key_spec("NoSuchKey"), None);
    }

    #[test]
    fn test_normalize_strips_locks() {
        let state = MOD_CONTROL | MOD_LOCK | MOD_NUMLOCK;
        assert_eq!(normalize_modifiers(state), MOD_CONTROL);
    }

    #[test]
    fn test_describe_key() {
        assert_eq!(describe_key('t' as u32, MOD_CONTROL), "C-t");
        assert_eq!(describe_key(0xff0d, 0), "Return");
        assert_eq!(describe_key(0x20, 0), "space");
    }

    #[test]
    fn test_bindings_from_config() {
        let mut config = Config::default();
        config
            .keybindings
            .bindings
            .insert("g".to_string(), "echo hi".to_string());
        let keys = KeyBindings::from_config(&config);
        assert_eq!(keys.lookup('g' as u32, 0), Some("echo hi"));
        assert_eq!(keys.lookup('n' as u32, 0), Some("next"));
        assert_eq!(keys.lookup('n' as u32, MOD_CONTROL), None);
        assert!(keys.is_prefix('t' as u32, MOD_CONTROL));
    }
}
