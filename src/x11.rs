//! The x11rb implementation of [`DisplayConn`].
//!
//! Translates raw X events into the manager's event vocabulary, owns the
//! atom table and the keycode-to-keysym mapping, and implements the error
//! discipline: inside an ignore scope, errors from windows that no longer
//! exist are swallowed; everything else is accumulated and surfaced as one
//! notification per loop iteration.

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::AsRawFd;

use anyhow::{bail, Context, Result};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::*;
use x11rb::protocol::{ErrorKind, Event};
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

use crate::conn::{
    ConfigureRequest, DisplayConn, IcccmState, KeyInput, Keysym, PropertyKind, ScreenHandles,
    StackDirective, WindowHandle, WmEvent,
};
use crate::types::{Rect, SizeHints};

/// WM_SIZE_HINTS flag bits
const P_MIN_SIZE: u32 = 1 << 4;
const P_MAX_SIZE: u32 = 1 << 5;
const P_RESIZE_INC: u32 = 1 << 6;

/// ICCCM WM_STATE values
const WM_STATE_WITHDRAWN: u32 = 0;
const WM_STATE_NORMAL: u32 = 1;
const WM_STATE_ICONIC: u32 = 3;

/// "cursor" font glyph for the waiting-for-command pointer
const XC_QUESTION_ARROW: u16 = 92;

/// Text metrics for the fixed font used on the bar
const CHAR_WIDTH: i16 = 7;
const LINE_HEIGHT: i16 = 14;
const BAR_PADDING: i16 = 4;

/// Atoms the manager needs
struct Atoms {
    wm_state: Atom,
    wm_change_state: Atom,
    wm_protocols: Atom,
    wm_delete_window: Atom,
    net_wm_name: Atom,
    utf8_string: Atom,
    command_request: Atom,
    command: Atom,
    command_result: Atom,
}

impl Atoms {
    fn new(conn: &RustConnection) -> Result<Self> {
        Ok(Self {
            wm_state: Self::intern(conn, b"WM_STATE")?,
            wm_change_state: Self::intern(conn, b"WM_CHANGE_STATE")?,
            wm_protocols: Self::intern(conn, b"WM_PROTOCOLS")?,
            wm_delete_window: Self::intern(conn, b"WM_DELETE_WINDOW")?,
            net_wm_name: Self::intern(conn, b"_NET_WM_NAME")?,
            utf8_string: Self::intern(conn, b"UTF8_STRING")?,
            command_request: Self::intern(conn, b"TRAPWM_COMMAND_REQUEST")?,
            command: Self::intern(conn, b"TRAPWM_COMMAND")?,
            command_result: Self::intern(conn, b"TRAPWM_COMMAND_RESULT")?,
        })
    }

    fn intern(conn: &RustConnection, name: &[u8]) -> Result<Atom> {
        Ok(conn.intern_atom(false, name)?.reply()?.atom)
    }
}

/// Keycode-to-keysym table, rebuilt when the server mapping changes.
struct KeyTable {
    min_keycode: u8,
    keysyms_per_keycode: usize,
    keysyms: Vec<u32>,
}

impl KeyTable {
    fn fetch(conn: &RustConnection) -> Result<Self> {
        let setup = conn.setup();
        let min_keycode = setup.min_keycode;
        let max_keycode = setup.max_keycode;
        let mapping = conn
            .get_keyboard_mapping(min_keycode, max_keycode - min_keycode + 1)?
            .reply()?;
        Ok(Self {
            min_keycode,
            keysyms_per_keycode: mapping.keysyms_per_keycode as usize,
            keysyms: mapping.keysyms,
        })
    }

    /// Keysym at shift level zero, like the binding table expects.
    fn keysym_for(&self, keycode: u8) -> Keysym {
        let idx = keycode.saturating_sub(self.min_keycode) as usize * self.keysyms_per_keycode;
        self.keysyms.get(idx).copied().unwrap_or(0)
    }

    fn keycodes_for(&self, keysym: Keysym) -> Vec<u8> {
        self.keysyms
            .chunks(self.keysyms_per_keycode.max(1))
            .enumerate()
            .filter(|(_, chunk)| chunk.contains(&keysym))
            .map(|(i, _)| self.min_keycode + i as u8)
            .collect()
    }
}

fn is_modifier_keysym(keysym: Keysym) -> bool {
    (0xffe1..=0xffee).contains(&keysym)
}

pub struct X11Conn {
    conn: RustConnection,
    atoms: Atoms,
    keytable: KeyTable,
    /// Events pulled off the wire during look-ahead, served before polling
    pending: VecDeque<Event>,
    /// Request windows read off the root pointer property but not yet served
    request_queue: VecDeque<WindowHandle>,
    roots: Vec<Window>,
    /// Helper window -> screen index, for drawing
    helper_screens: HashMap<Window, usize>,
    gcs: Vec<Gcontext>,
    wait_cursor: Cursor,
    ignore_depth: u32,
    errors: Vec<String>,
}

impl X11Conn {
    pub fn connect(display: Option<&str>) -> Result<Self> {
        let (conn, _) = RustConnection::connect(display).context("Failed to connect to X11 server")?;
        let atoms = Atoms::new(&conn)?;
        let keytable = KeyTable::fetch(&conn)?;

        // The cursor shown while waiting for a command keystroke
        let font = conn.generate_id()?;
        conn.open_font(font, b"cursor")?;
        let wait_cursor = conn.generate_id()?;
        conn.create_glyph_cursor(
            wait_cursor,
            font,
            font,
            XC_QUESTION_ARROW,
            XC_QUESTION_ARROW + 1,
            0,
            0,
            0,
            0xffff,
            0xffff,
            0xffff,
        )?;
        conn.close_font(font)?;

        Ok(Self {
            conn,
            atoms,
            keytable,
            pending: VecDeque::new(),
            request_queue: VecDeque::new(),
            roots: Vec::new(),
            helper_screens: HashMap::new(),
            gcs: Vec::new(),
            wait_cursor,
            ignore_depth: 0,
            errors: Vec::new(),
        })
    }

    fn create_helper(
        &self,
        screen: &x11rb::protocol::xproto::Screen,
        class: WindowClass,
        aux: &CreateWindowAux,
    ) -> Result<Window> {
        let window = self.conn.generate_id()?;
        self.conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            window,
            screen.root,
            -1,
            -1,
            1,
            1,
            0,
            class,
            x11rb::COPY_FROM_PARENT,
            aux,
        )?;
        Ok(window)
    }

    /// Record or swallow a protocol error from the event stream.
    fn note_error(&mut self, error: &x11rb::x11_utils::X11Error) {
        let expected_race = matches!(
            error.error_kind,
            ErrorKind::Window | ErrorKind::Drawable | ErrorKind::Match
        );
        if self.ignore_depth > 0 && expected_race {
            log::debug!("Ignoring expected {:?} error", error.error_kind);
            return;
        }
        self.errors
            .push(format!("{:?} (seq {})", error.error_kind, error.sequence));
    }

    /// Translate one raw event. Returns None for events consumed here
    /// (protocol errors).
    fn translate(&mut self, event: Event) -> Option<WmEvent> {
        match event {
            Event::Error(ref e) => {
                self.note_error(e);
                None
            }
            Event::CreateNotify(e) => Some(WmEvent::WindowCreated {
                window: e.window,
                parent: e.parent,
                override_redirect: e.override_redirect,
            }),
            Event::DestroyNotify(e) => Some(WmEvent::WindowDestroyed { window: e.window }),
            Event::MapRequest(e) => Some(WmEvent::MapRequest { window: e.window }),
            Event::MapNotify(e) => Some(WmEvent::MapCompleted { window: e.window }),
            Event::UnmapNotify(e) => Some(WmEvent::Unmap {
                window: e.window,
                event: e.event,
                synthetic: e.response_type & 0x80 != 0,
            }),
            Event::ConfigureRequest(e) => {
                let mask = e.value_mask;
                let get = |bit: ConfigWindow| mask.contains(bit);
                let stack = if get(ConfigWindow::STACK_MODE) {
                    if e.stack_mode == StackMode::ABOVE {
                        Some(StackDirective::Above)
                    } else if e.stack_mode == StackMode::BELOW {
                        Some(StackDirective::Below)
                    } else {
                        None
                    }
                } else {
                    None
                };
                Some(WmEvent::ConfigureRequest(ConfigureRequest {
                    window: e.window,
                    x: get(ConfigWindow::X).then_some(e.x as i32),
                    y: get(ConfigWindow::Y).then_some(e.y as i32),
                    width: get(ConfigWindow::WIDTH).then_some(e.width as u32),
                    height: get(ConfigWindow::HEIGHT).then_some(e.height as u32),
                    border_width: get(ConfigWindow::BORDER_WIDTH).then_some(e.border_width as u32),
                    stack,
                }))
            }
            Event::ConfigureNotify(e) => Some(WmEvent::GeometryChanged {
                window: e.window,
                x: e.x as i32,
                y: e.y as i32,
                width: e.width as u32,
                height: e.height as u32,
                border_width: e.border_width as u32,
            }),
            Event::PropertyNotify(e) => {
                let kind = if e.atom == self.atoms.command_request {
                    PropertyKind::CommandRequest
                } else if e.atom == u32::from(AtomEnum::WM_NAME) || e.atom == self.atoms.net_wm_name
                {
                    PropertyKind::Name
                } else if e.atom == u32::from(AtomEnum::WM_NORMAL_HINTS) {
                    PropertyKind::NormalHints
                } else if e.atom == u32::from(AtomEnum::WM_TRANSIENT_FOR) {
                    PropertyKind::TransientFor
                } else {
                    PropertyKind::Other
                };
                Some(WmEvent::PropertyChanged {
                    window: e.window,
                    kind,
                    deleted: e.state == Property::DELETE,
                })
            }
            Event::ClientMessage(e) => {
                if e.type_ != self.atoms.wm_change_state {
                    return Some(WmEvent::Ignored("ClientMessage"));
                }
                if e.format != 32 {
                    // Malformed change-state payload: log and drop
                    log::warn!(
                        "Malformed WM_CHANGE_STATE from 0x{:x} (format {})",
                        e.window,
                        e.format
                    );
                    return None;
                }
                if e.data.as_data32()[0] == WM_STATE_ICONIC {
                    Some(WmEvent::IconifyRequest { window: e.window })
                } else {
                    None
                }
            }
            Event::ColormapNotify(e) => Some(WmEvent::ColormapChanged {
                window: e.window,
                is_new: e.new,
            }),
            Event::FocusIn(e) => Some(WmEvent::FocusIn {
                window: e.event,
                grab: e.mode == NotifyMode::GRAB || e.mode == NotifyMode::WHILE_GRABBED,
            }),
            Event::MappingNotify(e) => Some(WmEvent::MappingChanged {
                pointer: e.request == Mapping::POINTER,
            }),
            Event::KeyPress(e) => Some(WmEvent::KeyPress {
                root: e.root,
                key: KeyInput {
                    keysym: self.keytable.keysym_for(e.detail),
                    modifiers: u16::from(e.state),
                    keycode: e.detail,
                },
            }),
            Event::KeyRelease(_) => Some(WmEvent::Ignored("KeyRelease")),
            Event::Expose(_) => Some(WmEvent::Ignored("Expose")),
            Event::EnterNotify(_) => Some(WmEvent::Ignored("EnterNotify")),
            Event::LeaveNotify(_) => Some(WmEvent::Ignored("LeaveNotify")),
            Event::FocusOut(_) => Some(WmEvent::Ignored("FocusOut")),
            Event::MotionNotify(_) => Some(WmEvent::Ignored("MotionNotify")),
            Event::ReparentNotify(_) => Some(WmEvent::Ignored("ReparentNotify")),
            Event::CirculateRequest(_) => Some(WmEvent::Ignored("CirculateRequest")),
            Event::CirculateNotify(_) => Some(WmEvent::Ignored("CirculateNotify")),
            Event::GravityNotify(_) => Some(WmEvent::Ignored("GravityNotify")),
            Event::NoExposure(_) => Some(WmEvent::Ignored("NoExposure")),
            Event::SelectionClear(_) => Some(WmEvent::Ignored("SelectionClear")),
            Event::SelectionNotify(_) => Some(WmEvent::Ignored("SelectionNotify")),
            Event::SelectionRequest(_) => Some(WmEvent::Ignored("SelectionRequest")),
            _ => Some(WmEvent::Ignored("unhandled")),
        }
    }

    /// Block until the connection fd is readable. Returns false when a
    /// signal interrupted the wait.
    fn wait_readable(&self) -> Result<bool> {
        let fd = self.conn.stream().as_raw_fd();
        let mut pollfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
        let rc = unsafe { libc::poll(&mut pollfd, 1, -1) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(false);
            }
            return Err(err.into());
        }
        Ok(true)
    }

    /// Block for the next raw event, regardless of kind.
    fn wait_raw_event(&mut self) -> Result<Event> {
        loop {
            if let Some(event) = self.conn.poll_for_event()? {
                return Ok(event);
            }
            self.conn.flush()?;
            // A keystroke wait is not cancellable; signals are latched and
            // handled once control returns to the main loop
            self.wait_readable()?;
        }
    }

    fn draw_text_lines(&mut self, window: Window, text: &str) -> Result<()> {
        let screen = self.helper_screens.get(&window).copied().unwrap_or(0);
        let gc = self.gcs[screen];
        let lines: Vec<&str> = text.lines().collect();
        let columns = lines.iter().map(|l| l.chars().count()).max().unwrap_or(1).max(1);
        let width = (columns as i16 * CHAR_WIDTH + BAR_PADDING * 2) as u32;
        let height = (lines.len().max(1) as i16 * LINE_HEIGHT + BAR_PADDING * 2) as u32;
        self.conn.configure_window(
            window,
            &ConfigureWindowAux::new().width(width).height(height),
        )?;
        self.conn.clear_area(false, window, 0, 0, 0, 0)?;
        for (i, line) in lines.iter().enumerate() {
            let baseline = BAR_PADDING + LINE_HEIGHT * (i as i16 + 1) - 3;
            let bytes = line.as_bytes();
            let bytes = &bytes[..bytes.len().min(250)];
            self.conn.image_text8(window, gc, BAR_PADDING, baseline, bytes)?;
        }
        Ok(())
    }
}

impl DisplayConn for X11Conn {
    fn screens(&mut self) -> Result<Vec<ScreenHandles>> {
        let mut handles = Vec::new();
        let roots: Vec<x11rb::protocol::xproto::Screen> = self.conn.setup().roots.clone();
        for (index, screen) in roots.iter().enumerate() {
            // The key sink takes keystrokes while command mode waits
            let key_window = self.create_helper(
                screen,
                WindowClass::INPUT_ONLY,
                &CreateWindowAux::new().event_mask(EventMask::KEY_PRESS),
            )?;
            self.conn.map_window(key_window)?;

            let popup = CreateWindowAux::new()
                .override_redirect(1)
                .background_pixel(screen.white_pixel)
                .border_pixel(screen.black_pixel)
                .event_mask(EventMask::EXPOSURE);
            let bar_window = self.create_helper(screen, WindowClass::INPUT_OUTPUT, &popup)?;
            let input_window = self.create_helper(screen, WindowClass::INPUT_OUTPUT, &popup)?;
            let frame_indicator = self.create_helper(screen, WindowClass::INPUT_OUTPUT, &popup)?;
            let help_window = self.create_helper(screen, WindowClass::INPUT_OUTPUT, &popup)?;

            let gc = self.conn.generate_id()?;
            let font = self.conn.generate_id()?;
            self.conn.open_font(font, b"fixed")?;
            self.conn.create_gc(
                gc,
                screen.root,
                &CreateGCAux::new()
                    .foreground(screen.black_pixel)
                    .background(screen.white_pixel)
                    .font(font),
            )?;
            self.conn.close_font(font)?;

            for helper in [bar_window, input_window, frame_indicator, help_window] {
                self.helper_screens.insert(helper, index);
            }
            self.roots.push(screen.root);
            self.gcs.push(gc);

            handles.push(ScreenHandles {
                root: screen.root,
                key_window,
                bar_window,
                input_window,
                frame_indicator,
                help_window,
                rect: Rect::new(
                    0,
                    0,
                    screen.width_in_pixels as u32,
                    screen.height_in_pixels as u32,
                ),
            });
        }
        self.conn.flush()?;
        Ok(handles)
    }

    fn become_wm(&mut self, root: WindowHandle) -> Result<()> {
        let event_mask = EventMask::SUBSTRUCTURE_REDIRECT
            | EventMask::SUBSTRUCTURE_NOTIFY
            | EventMask::PROPERTY_CHANGE;
        let cookie = self
            .conn
            .change_window_attributes(root, &ChangeWindowAttributesAux::new().event_mask(event_mask))?;
        self.conn.flush()?;
        if let Err(e) = cookie.check() {
            bail!("Another window manager is already running: {}", e);
        }
        log::info!("Managing root 0x{:x}", root);
        Ok(())
    }

    fn existing_windows(&mut self, root: WindowHandle) -> Result<Vec<WindowHandle>> {
        let tree = self.conn.query_tree(root)?.reply()?;
        let mut windows = Vec::new();
        for &window in &tree.children {
            let Ok(attrs) = self.conn.get_window_attributes(window)?.reply() else {
                continue;
            };
            if attrs.override_redirect || attrs.map_state != MapState::VIEWABLE {
                continue;
            }
            windows.push(window);
        }
        Ok(windows)
    }

    fn next_event(&mut self) -> Result<Option<WmEvent>> {
        loop {
            if let Some(raw) = self.pending.pop_front() {
                if let Some(event) = self.translate(raw) {
                    return Ok(Some(event));
                }
                continue;
            }
            match self.conn.poll_for_event()? {
                Some(raw) => {
                    if let Some(event) = self.translate(raw) {
                        return Ok(Some(event));
                    }
                }
                None => {
                    self.conn.flush()?;
                    if !self.wait_readable()? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn destroy_pending(&mut self) -> bool {
        // Pull everything currently buffered so the look-ahead sees it
        while let Ok(Some(raw)) = self.conn.poll_for_event() {
            self.pending.push_back(raw);
        }
        self.pending
            .iter()
            .any(|e| matches!(e, Event::DestroyNotify(_)))
    }

    fn map_window(&mut self, window: WindowHandle) -> Result<()> {
        self.conn.map_window(window)?;
        Ok(())
    }

    fn unmap_window(&mut self, window: WindowHandle) -> Result<()> {
        self.conn.unmap_window(window)?;
        Ok(())
    }

    fn raise_window(&mut self, window: WindowHandle) -> Result<()> {
        self.conn.configure_window(
            window,
            &ConfigureWindowAux::new().stack_mode(StackMode::ABOVE),
        )?;
        Ok(())
    }

    fn configure_window(&mut self, window: WindowHandle, rect: Rect, border_width: u32) -> Result<()> {
        self.conn.configure_window(
            window,
            &ConfigureWindowAux::new()
                .x(rect.x)
                .y(rect.y)
                .width(rect.width)
                .height(rect.height)
                .border_width(border_width),
        )?;
        Ok(())
    }

    fn apply_configure(&mut self, req: &ConfigureRequest) -> Result<()> {
        let mut aux = ConfigureWindowAux::new();
        aux.x = req.x;
        aux.y = req.y;
        aux.width = req.width;
        aux.height = req.height;
        aux.border_width = req.border_width;
        aux.stack_mode = req.stack.map(|s| match s {
            StackDirective::Above => StackMode::ABOVE,
            StackDirective::Below => StackMode::BELOW,
        });
        self.conn.configure_window(req.window, &aux)?;
        Ok(())
    }

    fn send_configure_notify(&mut self, window: WindowHandle, rect: Rect, border_width: u32) -> Result<()> {
        let event = ConfigureNotifyEvent {
            response_type: CONFIGURE_NOTIFY_EVENT,
            sequence: 0,
            event: window,
            window,
            above_sibling: x11rb::NONE,
            x: rect.x as i16,
            y: rect.y as i16,
            width: rect.width as u16,
            height: rect.height as u16,
            border_width: border_width as u16,
            override_redirect: false,
        };
        self.conn
            .send_event(false, window, EventMask::STRUCTURE_NOTIFY, event)?;
        Ok(())
    }

    fn set_icccm_state(&mut self, window: WindowHandle, state: IcccmState) -> Result<()> {
        let value = match state {
            IcccmState::Withdrawn => WM_STATE_WITHDRAWN,
            IcccmState::Normal => WM_STATE_NORMAL,
            IcccmState::Iconic => WM_STATE_ICONIC,
        };
        self.conn.change_property32(
            PropMode::REPLACE,
            window,
            self.atoms.wm_state,
            self.atoms.wm_state,
            &[value, x11rb::NONE],
        )?;
        Ok(())
    }

    fn set_input_focus(&mut self, window: WindowHandle) -> Result<()> {
        self.conn
            .set_input_focus(InputFocus::POINTER_ROOT, window, x11rb::CURRENT_TIME)?;
        Ok(())
    }

    fn install_colormap(&mut self, window: WindowHandle) -> Result<()> {
        if let Ok(attrs) = self.conn.get_window_attributes(window)?.reply() {
            if attrs.colormap != x11rb::NONE {
                self.conn.install_colormap(attrs.colormap)?;
            }
        }
        Ok(())
    }

    fn select_client_events(&mut self, window: WindowHandle) -> Result<()> {
        self.conn.change_window_attributes(
            window,
            &ChangeWindowAttributesAux::new().event_mask(
                EventMask::FOCUS_CHANGE | EventMask::PROPERTY_CHANGE | EventMask::COLOR_MAP_CHANGE,
            ),
        )?;
        Ok(())
    }

    fn delete_window(&mut self, window: WindowHandle) -> Result<()> {
        let supports_delete = self
            .conn
            .get_property(false, window, self.atoms.wm_protocols, AtomEnum::ATOM, 0, 32)
            .ok()
            .and_then(|c| c.reply().ok())
            .and_then(|r| {
                r.value32()
                    .map(|mut atoms| atoms.any(|a| a == self.atoms.wm_delete_window))
            })
            .unwrap_or(false);
        if supports_delete {
            let data = ClientMessageData::from([self.atoms.wm_delete_window, 0u32, 0, 0, 0]);
            let event = ClientMessageEvent {
                response_type: CLIENT_MESSAGE_EVENT,
                format: 32,
                sequence: 0,
                window,
                type_: self.atoms.wm_protocols,
                data,
            };
            self.conn.send_event(false, window, EventMask::NO_EVENT, event)?;
        } else {
            self.conn.kill_client(window)?;
        }
        self.conn.flush()?;
        Ok(())
    }

    fn kill_client(&mut self, window: WindowHandle) -> Result<()> {
        self.conn.kill_client(window)?;
        self.conn.flush()?;
        Ok(())
    }

    fn grab_prefix_key(&mut self, window: WindowHandle, key: KeyInput) -> Result<()> {
        // Grab with and without NumLock/CapsLock so lock state never hides
        // the prefix
        let lock_combos = [0u16, 1 << 1, 1 << 4, (1 << 1) | (1 << 4)];
        for keycode in self.keytable.keycodes_for(key.keysym) {
            for extra in lock_combos {
                self.conn.grab_key(
                    false,
                    window,
                    ModMask::from(key.modifiers | extra),
                    keycode,
                    GrabMode::ASYNC,
                    GrabMode::ASYNC,
                )?;
            }
        }
        Ok(())
    }

    fn ungrab_keys(&mut self, window: WindowHandle) -> Result<()> {
        self.conn.ungrab_key(0, window, ModMask::ANY)?;
        Ok(())
    }

    fn refresh_keyboard_mapping(&mut self) -> Result<()> {
        self.keytable = KeyTable::fetch(&self.conn)?;
        Ok(())
    }

    fn wait_for_key(&mut self, sink: WindowHandle, with_cursor: bool) -> Result<KeyInput> {
        let prior = self.conn.get_input_focus()?.reply()?;
        self.conn
            .set_input_focus(InputFocus::POINTER_ROOT, sink, x11rb::CURRENT_TIME)?;
        if with_cursor {
            self.conn.grab_pointer(
                false,
                sink,
                EventMask::NO_EVENT,
                GrabMode::ASYNC,
                GrabMode::ASYNC,
                x11rb::NONE,
                self.wait_cursor,
                x11rb::CURRENT_TIME,
            )?;
        }
        self.conn.flush()?;

        let key = loop {
            let raw = self.wait_raw_event()?;
            match raw {
                Event::KeyPress(e) => {
                    let keysym = self.keytable.keysym_for(e.detail);
                    if is_modifier_keysym(keysym) {
                        continue;
                    }
                    break KeyInput {
                        keysym,
                        modifiers: u16::from(e.state),
                        keycode: e.detail,
                    };
                }
                other => self.pending.push_back(other),
            }
        };

        if with_cursor {
            self.conn.ungrab_pointer(x11rb::CURRENT_TIME)?;
        }
        self.conn
            .set_input_focus(prior.revert_to, prior.focus, x11rb::CURRENT_TIME)?;
        self.conn.flush()?;
        Ok(key)
    }

    fn forward_key(&mut self, to: WindowHandle, key: KeyInput) -> Result<()> {
        let event = KeyPressEvent {
            response_type: KEY_PRESS_EVENT,
            detail: key.keycode,
            sequence: 0,
            time: x11rb::CURRENT_TIME,
            root: self.roots.first().copied().unwrap_or(x11rb::NONE),
            event: to,
            child: x11rb::NONE,
            root_x: 0,
            root_y: 0,
            event_x: 0,
            event_y: 0,
            state: KeyButMask::from(key.modifiers),
            same_screen: true,
        };
        self.conn.send_event(false, to, EventMask::KEY_PRESS, event)?;
        self.conn.flush()?;
        Ok(())
    }

    fn window_name(&mut self, window: WindowHandle) -> Option<String> {
        // Prefer _NET_WM_NAME, fall back to WM_NAME
        if let Ok(cookie) =
            self.conn
                .get_property(false, window, self.atoms.net_wm_name, self.atoms.utf8_string, 0, 1024)
        {
            if let Ok(reply) = cookie.reply() {
                if !reply.value.is_empty() {
                    if let Ok(s) = String::from_utf8(reply.value) {
                        return Some(s);
                    }
                }
            }
        }
        if let Ok(cookie) =
            self.conn
                .get_property(false, window, AtomEnum::WM_NAME, AtomEnum::STRING, 0, 1024)
        {
            if let Ok(reply) = cookie.reply() {
                if !reply.value.is_empty() {
                    if let Ok(s) = String::from_utf8(reply.value) {
                        return Some(s);
                    }
                }
            }
        }
        None
    }

    fn size_hints(&mut self, window: WindowHandle) -> SizeHints {
        let reply = match self.conn.get_property(
            false,
            window,
            AtomEnum::WM_NORMAL_HINTS,
            AtomEnum::WM_SIZE_HINTS,
            0,
            18,
        ) {
            Ok(cookie) => match cookie.reply() {
                Ok(reply) => reply,
                Err(_) => return SizeHints::default(),
            },
            Err(_) => return SizeHints::default(),
        };
        let values: Vec<u32> = match reply.value32() {
            Some(v) => v.collect(),
            None => return SizeHints::default(),
        };
        if values.len() < 11 {
            return SizeHints::default();
        }
        let flags = values[0];
        let mut hints = SizeHints::default();
        if flags & P_MIN_SIZE != 0 {
            hints.min = Some((values[5], values[6]));
        }
        if flags & P_MAX_SIZE != 0 {
            hints.max = Some((values[7], values[8]));
        }
        if flags & P_RESIZE_INC != 0 && (values[9] > 0 || values[10] > 0) {
            hints.inc = Some((values[9].max(1), values[10].max(1)));
        }
        hints
    }

    fn transient_for(&mut self, window: WindowHandle) -> Option<WindowHandle> {
        let reply = self
            .conn
            .get_property(false, window, AtomEnum::WM_TRANSIENT_FOR, AtomEnum::WINDOW, 0, 1)
            .ok()?
            .reply()
            .ok()?;
        let result = reply.value32()?.next().filter(|&w| w != x11rb::NONE);
        result
    }

    fn window_geometry(&mut self, window: WindowHandle) -> Option<(Rect, u32)> {
        let geometry = self.conn.get_geometry(window).ok()?.reply().ok()?;
        Some((
            Rect::new(
                geometry.x as i32,
                geometry.y as i32,
                geometry.width as u32,
                geometry.height as u32,
            ),
            geometry.border_width as u32,
        ))
    }

    fn take_command_request(&mut self, root: WindowHandle) -> Option<WindowHandle> {
        if self.request_queue.is_empty() {
            // Read-then-delete: the whole pointer property is consumed
            // atomically and served from the local queue
            let reply = self
                .conn
                .get_property(true, root, self.atoms.command_request, AtomEnum::WINDOW, 0, 1024)
                .ok()?
                .reply()
                .ok()?;
            if let Some(values) = reply.value32() {
                for value in values {
                    if value != x11rb::NONE {
                        self.request_queue.push_back(value);
                    }
                }
            };
        }
        self.request_queue.pop_front()
    }

    fn take_command_text(&mut self, request: WindowHandle) -> Option<String> {
        let reply = self
            .conn
            .get_property(true, request, self.atoms.command, AtomEnum::STRING, 0, u32::MAX / 4)
            .ok()?
            .reply()
            .ok()?;
        if reply.value.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&reply.value).into_owned())
    }

    fn write_command_result(&mut self, request: WindowHandle, text: &str) -> Result<()> {
        self.conn.change_property8(
            PropMode::REPLACE,
            request,
            self.atoms.command_result,
            AtomEnum::STRING,
            text.as_bytes(),
        )?;
        self.conn.flush()?;
        Ok(())
    }

    fn draw_message(&mut self, window: WindowHandle, at: (i32, i32), text: &str) -> Result<()> {
        self.conn
            .configure_window(window, &ConfigureWindowAux::new().x(at.0).y(at.1))?;
        self.draw_text_lines(window, text)?;
        Ok(())
    }

    fn begin_ignore_errors(&mut self) {
        if self.ignore_depth == 0 {
            // Force queued requests out so their errors land inside the scope
            let _ = self.conn.flush();
        }
        self.ignore_depth += 1;
    }

    fn end_ignore_errors(&mut self) {
        if self.ignore_depth == 1 {
            // Collect errors for requests issued inside the scope
            let _ = self.conn.flush();
            while let Ok(Some(raw)) = self.conn.poll_for_event() {
                self.pending.push_back(raw);
            }
            let pending = std::mem::take(&mut self.pending);
            for raw in pending {
                if let Event::Error(ref e) = raw {
                    self.note_error(e);
                } else {
                    self.pending.push_back(raw);
                }
            }
        }
        self.ignore_depth = self.ignore_depth.saturating_sub(1);
    }

    fn take_error_report(&mut self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        let count = self.errors.len();
        let first = self.errors[0].clone();
        self.errors.clear();
        Some(if count == 1 {
            format!("X error: {}", first)
        } else {
            format!("{} X errors, first: {}", count, first)
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.conn.flush()?;
        Ok(())
    }
}
