//! Logging initialization and utilities

use std::collections::HashSet;
use std::sync::Mutex;

use crate::math::SectionPos;

/// Initialize the logging system
///
/// Uses env_logger with default filter level of `info`.
/// Override with RUST_LOG environment variable.
///
/// # Example
/// ```no_run
/// lodterra::core::logging::init();
/// log::info!("Terrain cache started");
/// ```
pub fn init() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();
}

/// Like [`init`] but safe to call repeatedly (tests, embedded hosts).
pub fn try_init() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).try_init();
}

/// Remembers which positions have already produced a log line so corrupted
/// or failing sections don't flood the log every tick.
#[derive(Default)]
pub struct OncePerPosition {
    seen: Mutex<HashSet<SectionPos>>,
}

impl OncePerPosition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a position is seen.
    pub fn first_time(&self, pos: SectionPos) -> bool {
        match self.seen.lock() {
            Ok(mut seen) => seen.insert(pos),
            Err(poisoned) => poisoned.into_inner().insert(pos),
        }
    }

    /// Forget a position, e.g. after it loaded successfully.
    pub fn forget(&self, pos: SectionPos) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.remove(&pos);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
