//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::dispatch::Dispatcher;

/// Shared application state.
pub struct AppState {
    /// The controller-side dispatcher
    pub dispatcher: Dispatcher,
    /// Loaded configuration
    pub config: Arc<Config>,
    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    /// Creates the state.
    pub fn new(dispatcher: Dispatcher, config: Arc<Config>) -> Self {
        Self {
            dispatcher,
            config,
            start_time: Instant::now(),
        }
    }

    /// Seconds since the server started.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
