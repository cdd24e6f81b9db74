//! Cooperative cancellation and interrupt handling.
//!
//! The coordinator loop polls a [`CancelToken`] once per iteration. An [`InterruptGuard`]
//! routes Ctrl-C to a token for as long as the guard lives, and the interrupt handler does
//! nothing but set the flag: cleanup is left to the loop.

use crate::Result;
use core::sync::atomic::{AtomicBool, Ordering};
use ohno::app_err;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

const LOG_TARGET: &str = "  shutdown";

/// Exit code used when an interrupt arrives while no token is armed.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// A cloneable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// Armed tokens, innermost last.
static ARMED: Mutex<Vec<CancelToken>> = Mutex::new(Vec::new());

// ctrlc accepts a single handler per process, so it is installed once and forwards.
static HANDLER: OnceLock<core::result::Result<(), String>> = OnceLock::new();

fn deliver_interrupt() {
    let armed = ARMED.lock().unwrap_or_else(PoisonError::into_inner);
    match armed.last() {
        Some(token) => token.cancel(),
        None => std::process::exit(INTERRUPTED_EXIT_CODE),
    }
}

fn install_handler() -> Result<()> {
    HANDLER
        .get_or_init(|| ctrlc::set_handler(deliver_interrupt).map_err(|e| e.to_string()))
        .clone()
        .map_err(|e| app_err!("unable to install the interrupt handler: {e}"))
}

/// Routes interrupts to a token until dropped or restored.
///
/// Guards nest: arming a second guard shadows the first, and releasing it makes the first
/// one receive interrupts again. With no guard armed, an interrupt exits the process.
#[derive(Debug)]
pub struct InterruptGuard {
    token: CancelToken,
    released: bool,
}

impl InterruptGuard {
    /// Start routing interrupts to `token`.
    ///
    /// # Errors
    ///
    /// Fails if the process-wide interrupt handler cannot be installed, which happens when
    /// some other component has already claimed it.
    pub fn arm(token: CancelToken) -> Result<Self> {
        install_handler()?;

        ARMED.lock().unwrap_or_else(PoisonError::into_inner).push(token.clone());
        log::debug!(target: LOG_TARGET, "Interrupt handler armed");

        Ok(Self { token, released: false })
    }

    #[must_use]
    pub const fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Give interrupts back to whatever handled them before this guard was armed.
    pub fn restore(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }

        self.released = true;
        let mut armed = ARMED.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = armed.iter().rposition(|t| t.same(&self.token)) {
            let _ = armed.remove(index);
        }

        log::debug!(target: LOG_TARGET, "Interrupt handler restored");
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_clones_share_the_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn interrupts_reach_the_innermost_guard_then_the_previous_one() {
        let outer = InterruptGuard::arm(CancelToken::new()).unwrap();
        let inner = InterruptGuard::arm(CancelToken::new()).unwrap();
        let inner_token = inner.token().clone();

        deliver_interrupt();
        assert!(inner_token.is_cancelled());
        assert!(!outer.token().is_cancelled());

        inner.restore();
        deliver_interrupt();
        assert!(outer.token().is_cancelled());
    }
}
