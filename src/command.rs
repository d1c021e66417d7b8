//! The command interpreter and the property-based remote command protocol.
//!
//! Both the keybinding dispatch and remote requests funnel into
//! [`Wm::execute_command`]. Errors are surfaced as ordinary result text,
//! never as a distinct channel.

use std::os::unix::process::CommandExt;

use anyhow::Result;

use crate::conn::{DisplayConn, WindowHandle};
use crate::frames::SplitDirection;
use crate::signals;
use crate::tracing::Transition;
use crate::Wm;

impl<C: DisplayConn> Wm<C> {
    /// Execute one command line, returning its textual result (None for
    /// silent success).
    pub fn execute_command(&mut self, input: &str) -> Option<String> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        let (command, arg) = match input.split_once(char::is_whitespace) {
            Some((c, a)) => (c, a.trim()),
            None => (input, ""),
        };
        self.tracer.trace(Transition::CommandExecuted { command: input.to_string() });
        log::debug!("Executing command: {}", input);

        match command {
            "next" => self.cmd_rotate(true),
            "prev" => self.cmd_rotate(false),
            "other" => self.cmd_other(),
            "select" => self.cmd_select(arg),
            "windows" => Some(self.window_list()),
            "delete" => self.cmd_delete(),
            "kill" => self.cmd_kill(),
            "split" | "hsplit" => self.cmd_split(SplitDirection::Vertical),
            "vsplit" => self.cmd_split(SplitDirection::Horizontal),
            "only" => self.cmd_only(),
            "remove" => self.cmd_remove(),
            "focus" => self.cmd_focus_next_frame(),
            "curframe" => {
                let screen = self.current_screen;
                self.show_frame_indicator(screen).err().map(|e| e.to_string())
            }
            "exec" => self.cmd_exec(arg),
            "echo" => Some(arg.to_string()),
            "eventlog" => Some(self.tracer.dump_last(20)),
            "version" => Some(format!("trapwm {}", env!("CARGO_PKG_VERSION"))),
            "restart" => {
                signals::request_reload();
                None
            }
            "quit" => {
                self.running = false;
                None
            }
            _ => Some(format!("unknown command: {}", command)),
        }
    }

    fn cmd_rotate(&mut self, forward: bool) -> Option<String> {
        let mut ordered: Vec<(u32, WindowHandle)> = self
            .registry
            .mapped()
            .filter_map(|r| r.number.map(|n| (n, r.handle)))
            .collect();
        ordered.sort_unstable();
        if ordered.is_empty() {
            return Some("No managed windows".to_string());
        }
        let position = self
            .current_window
            .and_then(|w| ordered.iter().position(|&(_, h)| h == w));
        let next = match position {
            Some(i) if ordered.len() == 1 => ordered[i].1,
            Some(i) if forward => ordered[(i + 1) % ordered.len()].1,
            Some(i) => ordered[(i + ordered.len() - 1) % ordered.len()].1,
            None => ordered[0].1,
        };
        if Some(next) == self.current_window {
            return Some("Only one window".to_string());
        }
        self.set_active_window(next).err().map(|e| e.to_string())
    }

    fn cmd_other(&mut self) -> Option<String> {
        match self.switch_to_last_window() {
            Ok(true) => None,
            Ok(false) => Some("No other window".to_string()),
            Err(e) => Some(e.to_string()),
        }
    }

    fn cmd_select(&mut self, arg: &str) -> Option<String> {
        let number: u32 = match arg.parse() {
            Ok(n) => n,
            Err(_) => return Some(format!("select: bad window number {:?}", arg)),
        };
        let Some(window) = self.registry.find_by_number(number).map(|r| r.handle) else {
            return Some(format!("select: no window {}", number));
        };
        self.set_active_window(window).err().map(|e| e.to_string())
    }

    /// One line per mapped window: `N<marker> name`, `*` for the current
    /// window, `+` for the most recently accessed other window.
    fn window_list(&mut self) -> String {
        let mut entries: Vec<(u32, WindowHandle, String)> = self
            .registry
            .mapped()
            .filter_map(|r| r.number.map(|n| (n, r.handle, r.display_name.clone())))
            .collect();
        entries.sort_unstable_by_key(|&(n, _, _)| n);
        if entries.is_empty() {
            return "No managed windows".to_string();
        }
        let last = self
            .registry
            .mapped()
            .filter(|r| Some(r.handle) != self.current_window && r.last_access > 0)
            .max_by_key(|r| r.last_access)
            .map(|r| r.handle);
        entries
            .iter()
            .map(|(number, handle, name)| {
                let marker = if Some(*handle) == self.current_window {
                    '*'
                } else if Some(*handle) == last {
                    '+'
                } else {
                    '-'
                };
                format!("{}{} {}", number, marker, name)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn cmd_delete(&mut self) -> Option<String> {
        let Some(window) = self.current_window else {
            return Some("No current window".to_string());
        };
        self.conn.delete_window(window).err().map(|e| e.to_string())
    }

    fn cmd_kill(&mut self) -> Option<String> {
        let Some(window) = self.current_window else {
            return Some("No current window".to_string());
        };
        self.conn.kill_client(window).err().map(|e| e.to_string())
    }

    fn cmd_split(&mut self, direction: SplitDirection) -> Option<String> {
        let screen = self.current_screen;
        let current = self.screens[screen].frames.current;
        if self.screens[screen].frames.split(current, direction).is_none() {
            return Some("split failed".to_string());
        }
        self.refit_frame_occupant(screen, current)
            .err()
            .map(|e| e.to_string())
    }

    fn cmd_only(&mut self) -> Option<String> {
        let screen = self.current_screen;
        let rect = self.screens[screen].rect;
        let displaced = self.screens[screen].frames.only(rect);
        for window in displaced {
            if let Err(e) = self.hide_window(window) {
                return Some(e.to_string());
            }
        }
        let current = self.screens[screen].frames.current;
        self.refit_frame_occupant(screen, current)
            .err()
            .map(|e| e.to_string())
    }

    fn cmd_remove(&mut self) -> Option<String> {
        let screen = self.current_screen;
        let current = self.screens[screen].frames.current;
        let occupant = self.screens[screen].frames.get(current).and_then(|f| f.window);
        let Some(absorber) = self.screens[screen].frames.remove(current) else {
            return Some("Cannot remove the only frame".to_string());
        };
        if let Some(window) = occupant {
            if let Err(e) = self.hide_window(window) {
                return Some(e.to_string());
            }
        }
        if let Err(e) = self.refit_frame_occupant(screen, absorber) {
            return Some(e.to_string());
        }
        match self.screens[screen].frames.get(absorber).and_then(|f| f.window) {
            Some(window) => self.set_active_window(window).err().map(|e| e.to_string()),
            None => {
                self.current_window = None;
                None
            }
        }
    }

    fn cmd_focus_next_frame(&mut self) -> Option<String> {
        let screen = self.current_screen;
        let frames = &mut self.screens[screen].frames;
        if frames.len() < 2 {
            return None;
        }
        let next = frames.next_frame(frames.current);
        frames.current = next;
        match frames.get(next).unwrap().window {
            Some(window) => self.set_active_window(window).err().map(|e| e.to_string()),
            None => {
                // An empty frame takes focus via the key sink so keystrokes
                // still reach the manager
                self.current_window = None;
                let sink = self.screens[screen].key_window;
                self.conn.set_input_focus(sink).err().map(|e| e.to_string())
            }
        }
    }

    fn cmd_exec(&mut self, arg: &str) -> Option<String> {
        if arg.is_empty() {
            return Some("exec: missing command".to_string());
        }
        let expanded = shellexpand::tilde(arg).to_string();
        let mut command = std::process::Command::new("/bin/sh");
        command.arg("-c").arg(&expanded);
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        match command.spawn() {
            Ok(_) => None,
            Err(e) => Some(format!("exec {}: {}", expanded, e)),
        }
    }

    /// Drain the remote command queue: every queued request window is read,
    /// executed and answered in one pass. Requests with no command text are
    /// dropped without a reply.
    pub fn drain_command_requests(&mut self, screen: usize) -> Result<()> {
        let root = self.screens[screen].root;
        while let Some(request) = self.conn.take_command_request(root) {
            match self.conn.take_command_text(request) {
                Some(text) => {
                    log::debug!("Remote command from 0x{:x}: {}", request, text);
                    let result = self.execute_command(&text).unwrap_or_default();
                    self.conn.write_command_result(request, &result)?;
                }
                None => {
                    log::debug!("Request window 0x{:x} carried no command, dropped", request);
                }
            }
        }
        self.conn.flush()?;
        Ok(())
    }
}
