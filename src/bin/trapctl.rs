//! trapctl - send commands to a running trapwm
//!
//! Speaks the property-based remote command protocol: the command text goes
//! onto a throwaway request window, the request window's id is appended to
//! the root's request property, and the reply comes back on the request
//! window's result property.
//!
//! # Examples
//!
//! ```bash
//! # List managed windows
//! trapctl windows
//!
//! # Switch to window 2
//! trapctl select 2
//!
//! # Split the current frame
//! trapctl split
//! ```

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use x11rb::connection::Connection;
use x11rb::protocol::xproto::*;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;

/// trapctl - control a running trapwm
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// X display (default: $DISPLAY)
    #[arg(long)]
    display: Option<String>,

    /// Seconds to wait for a reply
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// The command line to send, e.g. `trapctl select 2`
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

fn intern(conn: &RustConnection, name: &[u8]) -> Result<Atom> {
    Ok(conn.intern_atom(false, name)?.reply()?.atom)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let text = cli.command.join(" ");

    let (conn, screen_num) =
        RustConnection::connect(cli.display.as_deref()).context("Failed to connect to X11 server")?;
    let root = conn.setup().roots[screen_num].root;

    let command_request = intern(&conn, b"TRAPWM_COMMAND_REQUEST")?;
    let command = intern(&conn, b"TRAPWM_COMMAND")?;
    let command_result = intern(&conn, b"TRAPWM_COMMAND_RESULT")?;

    // An unmapped throwaway window carries the request and its reply
    let request = conn.generate_id()?;
    conn.create_window(
        x11rb::COPY_DEPTH_FROM_PARENT,
        request,
        root,
        -1,
        -1,
        1,
        1,
        0,
        WindowClass::INPUT_OUTPUT,
        x11rb::COPY_FROM_PARENT,
        &CreateWindowAux::new().event_mask(EventMask::PROPERTY_CHANGE),
    )?;
    conn.change_property8(PropMode::REPLACE, request, command, AtomEnum::STRING, text.as_bytes())?;
    conn.change_property32(PropMode::APPEND, root, command_request, AtomEnum::WINDOW, &[request])?;
    conn.flush()?;

    let deadline = Instant::now() + Duration::from_secs(cli.timeout);
    loop {
        if let Some(event) = conn.poll_for_event()? {
            if let Event::PropertyNotify(e) = event {
                if e.window == request && e.atom == command_result && e.state == Property::NEW_VALUE
                {
                    let reply = conn
                        .get_property(true, request, command_result, AtomEnum::STRING, 0, u32::MAX / 4)?
                        .reply()?;
                    let result = String::from_utf8_lossy(&reply.value);
                    if !result.is_empty() {
                        println!("{}", result);
                    }
                    return Ok(());
                }
            }
            continue;
        }
        if Instant::now() >= deadline {
            bail!("no reply from trapwm after {}s", cli.timeout);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
