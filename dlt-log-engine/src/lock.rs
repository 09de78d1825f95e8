//! Advisory write-exclusion token for the log file
//!
//! The indexer holds the token while it scans; the live writer tries to take
//! it before appending and buffers when it cannot. Acquisition never blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct WriteToken {
    held: Arc<AtomicBool>,
}

impl WriteToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the token if it is free
    pub fn try_acquire(&self) -> Option<TokenGuard> {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| TokenGuard { held: Arc::clone(&self.held) })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the token when dropped
#[derive(Debug)]
pub struct TokenGuard {
    held: Arc<AtomicBool>,
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_exclusive() {
        let token = WriteToken::new();
        let shared = token.clone();

        let guard = token.try_acquire().unwrap();
        assert!(shared.is_held());
        assert!(shared.try_acquire().is_none());

        drop(guard);
        assert!(!token.is_held());
        assert!(shared.try_acquire().is_some());
    }

    #[test]
    fn test_guard_moves_across_threads() {
        let token = WriteToken::new();
        let guard = token.try_acquire().unwrap();
        std::thread::spawn(move || drop(guard)).join().unwrap();
        assert!(!token.is_held());
    }
}
