//! Wait queues - blocking consumers until a device has something for them
//!
//! ## Design
//!
//! A [`WaitQueue`] carries a generation counter. Every [`wake_up`] bumps it
//! and wakes every blocked waiter; waiters never consume anything from the
//! queue itself. Readiness always lives in the device, and a woken waiter
//! re-checks it, so spurious wakes are harmless.
//!
//! The missed-wakeup window is closed by ordering: a waiter records the
//! generation *before* evaluating its condition and then sleeps only while
//! the generation is unchanged. A notifier that updates device state and then
//! calls [`wake_up`] either runs before the condition check (which then sees
//! the new state) or bumps the generation the waiter is about to sleep on.
//!
//! ## Cancellation
//!
//! [`Signals`] is the per-calling-context cancellation token. Raising it
//! aborts a blocking wait with [`DriverError::Interrupted`]; the device is not
//! touched, so the caller may restart the call.
//!
//! [`wake_up`]: WaitQueue::wake_up

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use crate::{DriverError, Result};

/// Something a raised signal can kick awake
trait Wake: Send + Sync {
    fn wake(&self);
}

struct QueueState {
    generation: u64,
    pollers: Vec<Weak<PollEntry>>,
}

/// Wait/notify object
///
/// Any number of threads may block on one queue; [`wake_up`](Self::wake_up)
/// wakes them all.
pub struct WaitQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                generation: 0,
                pollers: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake every waiter and every registered poll table
    ///
    /// Never blocks for longer than the queue's internal lock is held, so it
    /// is usable from interrupt and timer context.
    pub fn wake_up(&self) {
        let pollers: Vec<Arc<PollEntry>> = {
            let mut state = self.lock();
            state.generation = state.generation.wrapping_add(1);
            state.pollers.retain(|p| p.strong_count() > 0);
            state.pollers.iter().filter_map(Weak::upgrade).collect()
        };
        self.cond.notify_all();

        for poller in pollers {
            poller.fire();
        }
    }

    /// Number of wake-ups delivered so far
    pub fn wakeups(&self) -> u64 {
        self.lock().generation
    }

    /// Number of poll tables currently registered
    pub fn poll_registrations(&self) -> usize {
        self.lock().pollers.len()
    }

    /// Block until `condition` holds
    ///
    /// `condition` is evaluated once up front and again after every wake-up.
    ///
    /// # Errors
    /// Returns `Interrupted` if `signals` is raised before the condition
    /// holds. A signal that is already pending when the call is made aborts
    /// it only if the condition is false.
    pub fn wait_event_interruptible<F>(
        self: &Arc<Self>,
        signals: &Signals,
        mut condition: F,
    ) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        let _armed = signals.arm(self.clone());

        loop {
            let seen = self.lock().generation;

            if condition() {
                return Ok(());
            }
            if signals.is_pending() {
                return Err(DriverError::Interrupted);
            }

            let state = self.lock();
            let _state = self
                .cond
                .wait_while(state, |s| s.generation == seen)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Wake for WaitQueue {
    fn wake(&self) {
        self.wake_up();
    }
}

struct PollEntry {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl PollEntry {
    fn fire(&self) {
        *self.fired.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }
}

impl Wake for PollEntry {
    // Taking the lock orders the kick after a waiter's signal check.
    fn wake(&self) {
        let _fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }
}

/// Registration of one multiplexed wait across several queues
///
/// A readiness query registers the table with its queue *before* sampling
/// the device. Any wake-up after registration marks the table fired, so a
/// following [`wait`](Self::wait) cannot miss it.
///
/// Dropping the table withdraws it from every queue it registered with.
pub struct PollTable {
    entry: Arc<PollEntry>,
    queues: Mutex<Vec<Weak<WaitQueue>>>,
}

impl PollTable {
    pub fn new() -> Self {
        Self {
            entry: Arc::new(PollEntry {
                fired: Mutex::new(false),
                cond: Condvar::new(),
            }),
            queues: Mutex::new(Vec::new()),
        }
    }

    /// Register with a queue
    ///
    /// Registering twice with the same queue is a no-op.
    pub fn register(&self, queue: &Arc<WaitQueue>) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        if queues.iter().any(|q| q.as_ptr() == Arc::as_ptr(queue)) {
            return;
        }

        {
            let mut state = queue.lock();
            state.pollers.retain(|p| p.strong_count() > 0);
            state.pollers.push(Arc::downgrade(&self.entry));
        }
        queues.push(Arc::downgrade(queue));
    }

    /// Whether any registered queue has been woken since registration
    pub fn fired(&self) -> bool {
        *self.entry.fired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a registered queue is woken
    ///
    /// # Errors
    /// Returns `Interrupted` if `signals` is raised first
    pub fn wait(&self, signals: &Signals) -> Result<()> {
        let _armed = signals.arm(self.entry.clone());

        let mut fired = self.entry.fired.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *fired {
                return Ok(());
            }
            if signals.is_pending() {
                return Err(DriverError::Interrupted);
            }
            fired = self
                .entry
                .cond
                .wait(fired)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Default for PollTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PollTable {
    fn drop(&mut self) {
        let entry = Arc::as_ptr(&self.entry);
        let queues = self.queues.get_mut().unwrap_or_else(PoisonError::into_inner);
        for queue in queues.drain(..).filter_map(|q| q.upgrade()) {
            queue
                .lock()
                .pollers
                .retain(|p| p.as_ptr() != entry && p.strong_count() > 0);
        }
    }
}

struct SignalState {
    pending: AtomicBool,
    target: Mutex<Option<Arc<dyn Wake>>>,
}

/// Cancellation token of one calling context
///
/// Clones share state: keep one clone in the blocked thread and hand another
/// to whoever may need to interrupt it.
#[derive(Clone)]
pub struct Signals {
    inner: Arc<SignalState>,
}

impl Signals {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalState {
                pending: AtomicBool::new(false),
                target: Mutex::new(None),
            }),
        }
    }

    /// Mark a signal pending and kick the context out of any wait
    pub fn raise(&self) {
        self.inner.pending.store(true, Ordering::SeqCst);

        let target = self
            .inner
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(target) = target {
            target.wake();
        }
    }

    /// Whether a signal is pending
    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Consume a pending signal; returns whether one was pending
    pub fn clear(&self) -> bool {
        self.inner.pending.swap(false, Ordering::SeqCst)
    }

    fn arm(&self, target: Arc<dyn Wake>) -> Armed<'_> {
        *self.inner.target.lock().unwrap_or_else(PoisonError::into_inner) = Some(target);
        Armed { signals: self }
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

/// Disarms the signal target when the wait ends
struct Armed<'a> {
    signals: &'a Signals,
}

impl Drop for Armed<'_> {
    fn drop(&mut self) {
        *self
            .signals
            .inner
            .target
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_condition_already_true() {
        let queue = Arc::new(WaitQueue::new());
        let signals = Signals::new();

        queue.wait_event_interruptible(&signals, || true).unwrap();
    }

    #[test]
    fn test_wake_after_state_change() {
        let queue = Arc::new(WaitQueue::new());
        let ready = Arc::new(AtomicBool::new(false));

        let waiter = {
            let queue = queue.clone();
            let ready = ready.clone();
            thread::spawn(move || {
                let signals = Signals::new();
                queue.wait_event_interruptible(&signals, || ready.load(Ordering::SeqCst))
            })
        };

        thread::sleep(Duration::from_millis(20));
        ready.store(true, Ordering::SeqCst);
        queue.wake_up();

        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_spurious_wakes_recheck_condition() {
        let queue = Arc::new(WaitQueue::new());
        let checks = Arc::new(AtomicUsize::new(0));
        let signals = Signals::new();

        let waiter = {
            let queue = queue.clone();
            let checks = checks.clone();
            let signals = signals.clone();
            thread::spawn(move || {
                queue.wait_event_interruptible(&signals, || {
                    checks.fetch_add(1, Ordering::SeqCst);
                    false
                })
            })
        };

        for _ in 0..5 {
            thread::sleep(Duration::from_millis(5));
            queue.wake_up();
        }
        thread::sleep(Duration::from_millis(20));
        signals.raise();

        assert!(matches!(waiter.join().unwrap(), Err(DriverError::Interrupted)));
        assert!(checks.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_pending_signal_aborts_only_unready_wait() {
        let queue = Arc::new(WaitQueue::new());
        let signals = Signals::new();
        signals.raise();

        queue.wait_event_interruptible(&signals, || true).unwrap();
        assert!(matches!(
            queue.wait_event_interruptible(&signals, || false),
            Err(DriverError::Interrupted)
        ));

        assert!(signals.clear());
        assert!(!signals.is_pending());
    }

    #[test]
    fn test_poll_table_sees_wake_after_register() {
        let queue = Arc::new(WaitQueue::new());
        let table = PollTable::new();
        let signals = Signals::new();

        table.register(&queue);
        assert!(!table.fired());

        queue.wake_up();
        assert!(table.fired());
        table.wait(&signals).unwrap();
    }

    #[test]
    fn test_poll_table_interrupted() {
        let queue = Arc::new(WaitQueue::new());
        let table = PollTable::new();
        let signals = Signals::new();
        table.register(&queue);

        let raiser = {
            let signals = signals.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                signals.raise();
            })
        };

        assert!(matches!(table.wait(&signals), Err(DriverError::Interrupted)));
        raiser.join().unwrap();
    }

    #[test]
    fn test_dropped_poll_table_deregisters() {
        let queue = Arc::new(WaitQueue::new());
        {
            let table = PollTable::new();
            table.register(&queue);
            assert_eq!(queue.poll_registrations(), 1);
        }
        assert_eq!(queue.poll_registrations(), 0);

        queue.wake_up();
        assert_eq!(queue.wakeups(), 1);
    }

    #[test]
    fn test_idle_polls_stay_bounded() {
        let queue = Arc::new(WaitQueue::new());

        for _ in 0..10_000 {
            PollTable::new().register(&queue);
        }
        assert_eq!(queue.poll_registrations(), 0);

        let table = PollTable::new();
        for _ in 0..100 {
            table.register(&queue);
        }
        assert_eq!(queue.poll_registrations(), 1);
        assert_eq!(queue.wakeups(), 0);
    }

    #[test]
    fn test_poll_table_outlives_queue() {
        let table = PollTable::new();
        {
            let queue = Arc::new(WaitQueue::new());
            table.register(&queue);
        }
        assert!(!table.fired());
    }
}
