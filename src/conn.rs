//! The seam between the window manager and the display server.
//!
//! Everything the manager needs from X is expressed as the [`DisplayConn`]
//! trait: a strictly ordered event stream, a look-ahead predicate for queued
//! destroy notifications, and the imperative protocol actions the handlers
//! issue. The production implementation lives in `x11.rs`; tests drive the
//! full dispatcher through the in-memory `FakeConn` below.

use anyhow::Result;

use crate::types::{Rect, SizeHints};

/// Opaque protocol handle for a window. Stable for the window's lifetime.
pub type WindowHandle = u32;

/// An X keysym.
pub type Keysym = u32;

/// ICCCM WM_STATE values mirrored onto managed windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcccmState {
    Withdrawn,
    Normal,
    Iconic,
}

/// Requested stacking change in a configure request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackDirective {
    Above,
    Below,
}

/// Which property changed, pre-classified by the backend so the dispatcher
/// never sees raw atoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// WM_NAME / _NET_WM_NAME
    Name,
    /// WM_NORMAL_HINTS
    NormalHints,
    /// WM_TRANSIENT_FOR
    TransientFor,
    /// The root-window remote command request pointer
    CommandRequest,
    Other,
}

/// One keystroke as delivered by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInput {
    pub keysym: Keysym,
    /// Raw modifier state, not yet normalized
    pub modifiers: u16,
    /// Keycode, kept so the keystroke can be forwarded verbatim
    pub keycode: u8,
}

/// A client's configure request. `None` fields were absent from the request's
/// value mask and must keep the window's last known value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigureRequest {
    pub window: WindowHandle,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub border_width: Option<u32>,
    pub stack: Option<StackDirective>,
}

/// The closed set of events the manager reacts to. Backends translate raw
/// protocol events into this enum; kinds the manager deliberately does not
/// act on arrive as `Ignored` so dispatch coverage stays visually complete
/// and unknown protocol additions degrade to a logged no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WmEvent {
    WindowCreated {
        window: WindowHandle,
        parent: WindowHandle,
        override_redirect: bool,
    },
    WindowDestroyed {
        window: WindowHandle,
    },
    MapRequest {
        window: WindowHandle,
    },
    MapCompleted {
        window: WindowHandle,
    },
    Unmap {
        window: WindowHandle,
        /// The window the event was reported relative to
        event: WindowHandle,
        /// True for client-sent (ICCCM withdrawal) events
        synthetic: bool,
    },
    ConfigureRequest(ConfigureRequest),
    GeometryChanged {
        window: WindowHandle,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        border_width: u32,
    },
    PropertyChanged {
        window: WindowHandle,
        kind: PropertyKind,
        deleted: bool,
    },
    /// Well-formed WM_CHANGE_STATE client message asking for iconification.
    /// Malformed payloads are dropped at the translation layer.
    IconifyRequest {
        window: WindowHandle,
    },
    ColormapChanged {
        window: WindowHandle,
        is_new: bool,
    },
    FocusIn {
        window: WindowHandle,
        /// True when the focus change was caused by a grab
        grab: bool,
    },
    MappingChanged {
        pointer: bool,
    },
    KeyPress {
        root: WindowHandle,
        key: KeyInput,
    },
    Ignored(&'static str),
}

/// Per-screen window handles created by the backend at startup. The helper
/// windows are the manager's own surfaces and are excluded from management.
#[derive(Debug, Clone, Copy)]
pub struct ScreenHandles {
    pub root: WindowHandle,
    pub key_window: WindowHandle,
    pub bar_window: WindowHandle,
    pub input_window: WindowHandle,
    pub frame_indicator: WindowHandle,
    pub help_window: WindowHandle,
    pub rect: Rect,
}

/// Abstract display connection: event source plus protocol actions.
///
/// Query methods return `Option` rather than `Result` because a failed query
/// on a window is almost always the expected already-destroyed race and the
/// caller treats it the same as an absent property.
pub trait DisplayConn {
    // -- setup ---------------------------------------------------------------

    /// Enumerate screens, creating the per-screen helper windows.
    fn screens(&mut self) -> Result<Vec<ScreenHandles>>;

    /// Claim substructure redirection on a root. Fails if another window
    /// manager is running.
    fn become_wm(&mut self, root: WindowHandle) -> Result<()>;

    /// Viewable, non-override-redirect top-levels already present at startup.
    fn existing_windows(&mut self, root: WindowHandle) -> Result<Vec<WindowHandle>>;

    // -- event source --------------------------------------------------------

    /// Pull the next event. Buffered events are served without blocking;
    /// otherwise blocks in an OS-level readiness wait. Returns `Ok(None)`
    /// when the wait was interrupted by a signal so the caller can re-check
    /// its latched flags.
    fn next_event(&mut self) -> Result<Option<WmEvent>>;

    /// Non-blocking look-ahead: is a destroy notification already queued?
    fn destroy_pending(&mut self) -> bool;

    // -- protocol actions ----------------------------------------------------

    fn map_window(&mut self, window: WindowHandle) -> Result<()>;
    fn unmap_window(&mut self, window: WindowHandle) -> Result<()>;
    fn raise_window(&mut self, window: WindowHandle) -> Result<()>;
    fn configure_window(&mut self, window: WindowHandle, rect: Rect, border_width: u32) -> Result<()>;
    /// Apply a configure request for an unmanaged window exactly as asked.
    fn apply_configure(&mut self, req: &ConfigureRequest) -> Result<()>;
    /// Send a synthetic ConfigureNotify reflecting granted geometry.
    fn send_configure_notify(&mut self, window: WindowHandle, rect: Rect, border_width: u32) -> Result<()>;
    fn set_icccm_state(&mut self, window: WindowHandle, state: IcccmState) -> Result<()>;
    fn set_input_focus(&mut self, window: WindowHandle) -> Result<()>;
    fn install_colormap(&mut self, window: WindowHandle) -> Result<()>;
    /// Subscribe to focus/property/colormap events on a managed window.
    fn select_client_events(&mut self, window: WindowHandle) -> Result<()>;
    /// Ask the client to close gracefully (WM_DELETE_WINDOW if supported).
    fn delete_window(&mut self, window: WindowHandle) -> Result<()>;
    fn kill_client(&mut self, window: WindowHandle) -> Result<()>;

    // -- keyboard ------------------------------------------------------------

    fn grab_prefix_key(&mut self, window: WindowHandle, key: KeyInput) -> Result<()>;
    fn ungrab_keys(&mut self, window: WindowHandle) -> Result<()>;
    fn refresh_keyboard_mapping(&mut self) -> Result<()>;
    /// Redirect focus to `sink`, block for exactly one non-modifier
    /// keystroke, restore focus. Not cancellable.
    fn wait_for_key(&mut self, sink: WindowHandle, with_cursor: bool) -> Result<KeyInput>;
    /// Forward a keystroke verbatim as a synthetic key press.
    fn forward_key(&mut self, to: WindowHandle, key: KeyInput) -> Result<()>;

    // -- window queries ------------------------------------------------------

    fn window_name(&mut self, window: WindowHandle) -> Option<String>;
    fn size_hints(&mut self, window: WindowHandle) -> SizeHints;
    fn transient_for(&mut self, window: WindowHandle) -> Option<WindowHandle>;
    fn window_geometry(&mut self, window: WindowHandle) -> Option<(Rect, u32)>;

    // -- remote command protocol ---------------------------------------------

    /// Read and atomically clear the next queued request-window handle from
    /// the root request property.
    fn take_command_request(&mut self, root: WindowHandle) -> Option<WindowHandle>;
    /// Read and atomically clear the command text on a request window.
    fn take_command_text(&mut self, request: WindowHandle) -> Option<String>;
    /// Write the reply (replace semantics, possibly empty).
    fn write_command_result(&mut self, request: WindowHandle, text: &str) -> Result<()>;

    // -- bar / indicator drawing ---------------------------------------------

    /// Size the message window to fit `text` and draw it.
    fn draw_message(&mut self, window: WindowHandle, at: (i32, i32), text: &str) -> Result<()>;

    // -- error discipline ----------------------------------------------------

    /// Enter a scope in which "no such window" protocol errors are expected
    /// and swallowed. Scopes nest.
    fn begin_ignore_errors(&mut self);
    fn end_ignore_errors(&mut self);
    /// Drain protocol errors accumulated outside ignore scopes, formatted
    /// for a single user-visible notification.
    fn take_error_report(&mut self) -> Option<String>;

    fn flush(&mut self) -> Result<()>;
}

#[cfg(test)]
pub mod testing {
    //! In-memory `DisplayConn` for driving the dispatcher in tests.

    use std::collections::{HashMap, VecDeque};

    use super::*;

    /// Every protocol action the fake connection has been asked to perform,
    /// in order. Tests assert on this log.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Action {
        Map(WindowHandle),
        Unmap(WindowHandle),
        Raise(WindowHandle),
        Configure { window: WindowHandle, rect: Rect, border_width: u32 },
        ApplyConfigure(WindowHandle),
        SyntheticConfigure { window: WindowHandle, rect: Rect, border_width: u32 },
        SetState { window: WindowHandle, state: IcccmState },
        Focus(WindowHandle),
        InstallColormap(WindowHandle),
        SelectInput(WindowHandle),
        Delete(WindowHandle),
        Kill(WindowHandle),
        GrabPrefix(WindowHandle),
        UngrabKeys(WindowHandle),
        RefreshMapping,
        WaitForKey { with_cursor: bool },
        ForwardKey { to: WindowHandle, keysym: Keysym },
        WriteResult { window: WindowHandle, text: String },
        DrawMessage { window: WindowHandle, text: String },
    }

    pub const FAKE_ROOT: WindowHandle = 1;
    pub const FAKE_KEY_WINDOW: WindowHandle = 2;
    pub const FAKE_BAR_WINDOW: WindowHandle = 3;
    pub const FAKE_INPUT_WINDOW: WindowHandle = 4;
    pub const FAKE_FRAME_INDICATOR: WindowHandle = 5;
    pub const FAKE_HELP_WINDOW: WindowHandle = 6;

    #[derive(Default)]
    pub struct FakeConn {
        pub events: VecDeque<WmEvent>,
        pub actions: Vec<Action>,
        /// Scripted replies for `wait_for_key`
        pub keys: VecDeque<KeyInput>,
        pub names: HashMap<WindowHandle, String>,
        pub hints: HashMap<WindowHandle, SizeHints>,
        pub transients: HashMap<WindowHandle, WindowHandle>,
        pub geometries: HashMap<WindowHandle, (Rect, u32)>,
        pub initial_windows: Vec<WindowHandle>,
        pub command_requests: VecDeque<WindowHandle>,
        pub command_texts: HashMap<WindowHandle, String>,
        pub error_report: Option<String>,
        pub ignore_depth: u32,
    }

    impl FakeConn {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn queue(&mut self, event: WmEvent) {
            self.events.push_back(event);
        }

        /// Run the manager over every queued event.
        pub fn drain_into(wm: &mut crate::Wm<FakeConn>) {
            while let Some(event) = wm.conn.events.pop_front() {
                wm.dispatch(event).unwrap();
            }
        }

        pub fn actions_of<F: Fn(&Action) -> bool>(&self, pred: F) -> Vec<&Action> {
            self.actions.iter().filter(|a| pred(a)).collect()
        }
    }

    impl DisplayConn for FakeConn {
        fn screens(&mut self) -> Result<Vec<ScreenHandles>> {
            Ok(vec![ScreenHandles {
                root: FAKE_ROOT,
                key_window: FAKE_KEY_WINDOW,
                bar_window: FAKE_BAR_WINDOW,
                input_window: FAKE_INPUT_WINDOW,
                frame_indicator: FAKE_FRAME_INDICATOR,
                help_window: FAKE_HELP_WINDOW,
                rect: Rect::new(0, 0, 800, 600),
            }])
        }

        fn become_wm(&mut self, _root: WindowHandle) -> Result<()> {
            Ok(())
        }

        fn existing_windows(&mut self, _root: WindowHandle) -> Result<Vec<WindowHandle>> {
            Ok(self.initial_windows.clone())
        }

        fn next_event(&mut self) -> Result<Option<WmEvent>> {
            Ok(self.events.pop_front())
        }

        fn destroy_pending(&mut self) -> bool {
            self.events
                .iter()
                .any(|e| matches!(e, WmEvent::WindowDestroyed { .. }))
        }

        fn map_window(&mut self, window: WindowHandle) -> Result<()> {
            self.actions.push(Action::Map(window));
            Ok(())
        }

        fn unmap_window(&mut self, window: WindowHandle) -> Result<()> {
            self.actions.push(Action::Unmap(window));
            Ok(())
        }

        fn raise_window(&mut self, window: WindowHandle) -> Result<()> {
            self.actions.push(Action::Raise(window));
            Ok(())
        }

        fn configure_window(&mut self, window: WindowHandle, rect: Rect, border_width: u32) -> Result<()> {
            self.actions.push(Action::Configure { window, rect, border_width });
            Ok(())
        }

        fn apply_configure(&mut self, req: &ConfigureRequest) -> Result<()> {
            self.actions.push(Action::ApplyConfigure(req.window));
            Ok(())
        }

        fn send_configure_notify(&mut self, window: WindowHandle, rect: Rect, border_width: u32) -> Result<()> {
            self.actions.push(Action::SyntheticConfigure { window, rect, border_width });
            Ok(())
        }

        fn set_icccm_state(&mut self, window: WindowHandle, state: IcccmState) -> Result<()> {
            self.actions.push(Action::SetState { window, state });
            Ok(())
        }

        fn set_input_focus(&mut self, window: WindowHandle) -> Result<()> {
            self.actions.push(Action::Focus(window));
            Ok(())
        }

        fn install_colormap(&mut self, window: WindowHandle) -> Result<()> {
            self.actions.push(Action::InstallColormap(window));
            Ok(())
        }

        fn select_client_events(&mut self, window: WindowHandle) -> Result<()> {
            self.actions.push(Action::SelectInput(window));
            Ok(())
        }

        fn delete_window(&mut self, window: WindowHandle) -> Result<()> {
            self.actions.push(Action::Delete(window));
            Ok(())
        }

        fn kill_client(&mut self, window: WindowHandle) -> Result<()> {
            self.actions.push(Action::Kill(window));
            Ok(())
        }

        fn grab_prefix_key(&mut self, window: WindowHandle, _key: KeyInput) -> Result<()> {
            self.actions.push(Action::GrabPrefix(window));
            Ok(())
        }

        fn ungrab_keys(&mut self, window: WindowHandle) -> Result<()> {
            self.actions.push(Action::UngrabKeys(window));
            Ok(())
        }

        fn refresh_keyboard_mapping(&mut self) -> Result<()> {
            self.actions.push(Action::RefreshMapping);
            Ok(())
        }

        fn wait_for_key(&mut self, _sink: WindowHandle, with_cursor: bool) -> Result<KeyInput> {
            self.actions.push(Action::WaitForKey { with_cursor });
            self.keys
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no scripted key"))
        }

        fn forward_key(&mut self, to: WindowHandle, key: KeyInput) -> Result<()> {
            self.actions.push(Action::ForwardKey { to, keysym: key.keysym });
            Ok(())
        }

        fn window_name(&mut self, window: WindowHandle) -> Option<String> {
            self.names.get(&window).cloned()
        }

        fn size_hints(&mut self, window: WindowHandle) -> SizeHints {
            self.hints.get(&window).copied().unwrap_or_default()
        }

        fn transient_for(&mut self, window: WindowHandle) -> Option<WindowHandle> {
            self.transients.get(&window).copied()
        }

        fn window_geometry(&mut self, window: WindowHandle) -> Option<(Rect, u32)> {
            self.geometries.get(&window).copied()
        }

        fn take_command_request(&mut self, _root: WindowHandle) -> Option<WindowHandle> {
            self.command_requests.pop_front()
        }

        fn take_command_text(&mut self, request: WindowHandle) -> Option<String> {
            self.command_texts.remove(&request)
        }

        fn write_command_result(&mut self, request: WindowHandle, text: &str) -> Result<()> {
            self.actions.push(Action::WriteResult { window: request, text: text.to_string() });
            Ok(())
        }

        fn draw_message(&mut self, window: WindowHandle, _at: (i32, i32), text: &str) -> Result<()> {
            self.actions.push(Action::DrawMessage { window, text: text.to_string() });
            Ok(())
        }

        fn begin_ignore_errors(&mut self) {
            self.ignore_depth += 1;
        }

        fn end_ignore_errors(&mut self) {
            self.ignore_depth = self.ignore_depth.saturating_sub(1);
        }

        fn take_error_report(&mut self) -> Option<String> {
            self.error_report.take()
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
