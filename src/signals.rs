//! OS signal latching and mask control.
//!
//! Signals arrive asynchronously but the engine wants to observe them at one
//! well-defined point per iteration. The handlers installed here therefore do
//! nothing but set an `AtomicBool`; the engine drains the flags through
//! [`SignalBridge::next`] with all signals blocked, so no handler can run in
//! the middle of the drain.
//!
//! Latching `SIGPIPE` also replaces its default disposition, so a write to a
//! socket whose peer has gone away surfaces as `EPIPE` on the descriptor
//! instead of killing the process.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use signal_hook::consts::signal::{SIGALRM, SIGINT, SIGPIPE, SIGQUIT, SIGTERM};

/// Signals the bridge latches, in the order [`SignalBridge::next`] reports
/// them when several are pending at once.
const LATCHED: [i32; 5] = [SIGALRM, SIGPIPE, SIGINT, SIGTERM, SIGQUIT];

/// Flag-latching signal bridge.
///
/// One flag per latched signal. `block`/`unblock` bracket any section that
/// must not be interleaved with a handler (flag draining, stderr writes).
pub struct SignalBridge {
    flags: Vec<(i32, Arc<AtomicBool>)>,
    saved_mask: Option<libc::sigset_t>,
}

impl SignalBridge {
    /// Install the flag-setting handlers for all latched signals.
    ///
    /// # Errors
    ///
    /// Returns an error if any handler registration is rejected by the OS.
    pub fn install() -> Result<Self> {
        let mut flags = Vec::with_capacity(LATCHED.len());
        for &sig in &LATCHED {
            let flag = Arc::new(AtomicBool::new(false));
            signal_hook::flag::register(sig, Arc::clone(&flag))
                .with_context(|| format!("install handler for signal {sig}"))?;
            flags.push((sig, flag));
        }
        Ok(Self {
            flags,
            saved_mask: None,
        })
    }

    /// Block every signal, remembering the previous mask for [`unblock`].
    ///
    /// [`unblock`]: SignalBridge::unblock
    pub fn block(&mut self) {
        self.saved_mask = block_all();
    }

    /// Restore the signal mask saved by the matching [`block`] call.
    ///
    /// [`block`]: SignalBridge::block
    pub fn unblock(&mut self) {
        if let Some(mask) = self.saved_mask.take() {
            restore(mask);
        }
    }

    /// Pop the next pending signal number, clearing its flag.
    ///
    /// Returns 0 when nothing is pending. Call with signals blocked, or a
    /// delivery racing the drain may be observed one iteration late.
    pub fn next(&self) -> i32 {
        for (sig, flag) in &self.flags {
            if flag.swap(false, Ordering::Relaxed) {
                return *sig;
            }
        }
        0
    }
}

/// Human-readable name for a latched signal, for log lines.
pub fn name(sig: i32) -> &'static str {
    match sig {
        SIGALRM => "SIGALRM",
        SIGPIPE => "SIGPIPE",
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        SIGQUIT => "SIGQUIT",
        _ => "unknown",
    }
}

/// Install a full signal mask, returning the previous mask.
///
/// Returns `None` if the mask could not be installed; the caller proceeds
/// unfenced in that case rather than aborting.
pub(crate) fn block_all() -> Option<libc::sigset_t> {
    unsafe {
        let mut all = MaybeUninit::<libc::sigset_t>::uninit();
        if libc::sigfillset(all.as_mut_ptr()) != 0 {
            return None;
        }
        let mut prev = MaybeUninit::<libc::sigset_t>::uninit();
        if libc::sigprocmask(libc::SIG_SETMASK, all.as_ptr(), prev.as_mut_ptr()) != 0 {
            return None;
        }
        Some(prev.assume_init())
    }
}

/// Restore a signal mask previously returned by [`block_all`].
pub(crate) fn restore(mask: libc::sigset_t) {
    unsafe {
        libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Every installed bridge sees the same process-wide deliveries, so these
    // tests drain their bridge rather than expect emptiness, and only assert
    // on flags no concurrent test can clear.

    #[test]
    fn raised_signal_is_latched() {
        let mut bridge = SignalBridge::install().expect("install bridge");

        unsafe { libc::raise(SIGALRM) };

        bridge.block();
        let mut seen_alarm = false;
        loop {
            match bridge.next() {
                0 => break,
                SIGALRM => seen_alarm = true,
                _ => {}
            }
        }
        bridge.unblock();
        assert!(seen_alarm, "SIGALRM flag was not latched");
    }

    #[test]
    fn block_unblock_round_trips() {
        let mut bridge = SignalBridge::install().expect("install bridge");
        bridge.block();
        bridge.unblock();
        // A second unblock without a block must be a no-op.
        bridge.unblock();
    }

    #[test]
    fn signal_names() {
        assert_eq!(name(SIGTERM), "SIGTERM");
        assert_eq!(name(9999), "unknown");
    }
}
