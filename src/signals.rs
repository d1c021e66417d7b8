//! Latched signal flags and the bar auto-hide timer.
//!
//! Handlers installed here only store into atomic flags; all actual work
//! happens in the main loop, which consults the flags once per iteration.
//! The handlers are installed without SA_RESTART so a signal interrupts the
//! blocking readiness wait and control returns to the loop promptly.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};

static RELOAD: AtomicBool = AtomicBool::new(false);
static TERMINATE: AtomicBool = AtomicBool::new(false);
static ALARM: AtomicBool = AtomicBool::new(false);

extern "C" fn on_hup(_: libc::c_int) {
    RELOAD.store(true, Ordering::Relaxed);
}

extern "C" fn on_term(_: libc::c_int) {
    TERMINATE.store(true, Ordering::Relaxed);
}

extern "C" fn on_alarm(_: libc::c_int) {
    ALARM.store(true, Ordering::Relaxed);
}

fn install_handler(signal: libc::c_int, handler: extern "C" fn(libc::c_int)) -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
            bail!("sigaction({}) failed: {}", signal, std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Install all handlers. SIGHUP reloads, SIGTERM/SIGINT terminate, SIGALRM
/// drives the bar auto-hide.
pub fn install() -> Result<()> {
    install_handler(libc::SIGHUP, on_hup)?;
    install_handler(libc::SIGTERM, on_term)?;
    install_handler(libc::SIGINT, on_term)?;
    install_handler(libc::SIGALRM, on_alarm)?;
    Ok(())
}

pub fn take_reload() -> bool {
    RELOAD.swap(false, Ordering::Relaxed)
}

pub fn take_terminate() -> bool {
    TERMINATE.swap(false, Ordering::Relaxed)
}

pub fn take_alarm() -> bool {
    ALARM.swap(false, Ordering::Relaxed)
}

/// Request a reload from inside the manager (the `restart` command).
pub fn request_reload() {
    RELOAD.store(true, Ordering::Relaxed);
}

/// Replace the process image with the same program and original arguments.
/// Only returns on failure.
pub fn exec_self(argv: &[String]) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let err = std::process::Command::new(&argv[0]).args(&argv[1..]).exec();
    bail!("re-exec of {} failed: {}", argv[0], err)
}

/// One-shot alarm used to auto-hide the message bar. Disabled in tests so
/// nothing arms a real process alarm.
pub struct BarTimer {
    enabled: bool,
}

impl BarTimer {
    pub fn system() -> Self {
        Self { enabled: true }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    /// Arm the timer for `seconds`; zero or negative disables auto-hide.
    pub fn arm(&self, seconds: i64) {
        if self.enabled && seconds > 0 {
            unsafe {
                libc::alarm(seconds as libc::c_uint);
            }
        }
    }

    pub fn cancel(&self) {
        if self.enabled {
            unsafe {
                libc::alarm(0);
            }
        }
    }
}
