//! Poll Timer - periodic callbacks for devices without a usable interrupt
//!
//! The timer fires once after a short initial delay and then on a fixed
//! period. The callback runs on the timer's own thread and must not block.
//!
//! [`PollTimer::cancel`] is synchronous: when it returns the callback is not
//! running and will never run again. Drivers rely on this to tear down the
//! registers the callback touches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};

use crate::{DriverError, Result};

/// Periodic timer backed by a dedicated thread
pub struct PollTimer {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    fires: Arc<AtomicU64>,
    initial_delay: Duration,
    period: Duration,
}

impl PollTimer {
    /// Arm a timer
    ///
    /// # Arguments
    /// * `name` - Thread name, for diagnostics
    /// * `initial_delay` - Delay before the first fire
    /// * `period` - Interval between subsequent fires
    /// * `callback` - Invoked on every fire
    ///
    /// # Errors
    /// Returns `ResourceUnavailable` if the timer thread cannot be spawned
    pub fn start<F>(name: &str, initial_delay: Duration, period: Duration, callback: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let fires = Arc::new(AtomicU64::new(0));

        let thread = {
            let fires = fires.clone();
            thread::Builder::new()
                .name(name.into())
                .spawn(move || {
                    let fire = || {
                        fires.fetch_add(1, Ordering::SeqCst);
                        callback();
                    };

                    let first = channel::after(initial_delay);
                    channel::select! {
                        recv(stop_rx) -> _ => return,
                        recv(first) -> _ => fire(),
                    }

                    let ticker = channel::tick(period);
                    loop {
                        channel::select! {
                            recv(stop_rx) -> _ => return,
                            recv(ticker) -> _ => fire(),
                        }
                    }
                })
                .map_err(|e| DriverError::ResourceUnavailable(format!("timer thread: {e}")))?
        };

        log::debug!(
            "poll timer {}: first fire in {:?}, then every {:?}",
            name,
            initial_delay,
            period
        );

        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
            fires,
            initial_delay,
            period,
        })
    }

    /// Stop the timer and wait for an in-flight callback to finish
    pub fn cancel(&mut self) {
        // Dropping the sender disconnects the channel the thread selects on
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("poll timer callback panicked");
            }
        }
    }

    /// Whether the timer is still armed
    pub fn is_armed(&self) -> bool {
        self.thread.is_some()
    }

    /// Number of times the timer has fired
    pub fn fire_count(&self) -> u64 {
        self.fires.load(Ordering::SeqCst)
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Drop for PollTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
