//! Small host-side synchronization helpers: a settable event with timed
//! waits, and the shared stop flag handed to long-running stream calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A boolean flag threads can block on, with a deadline.
pub(crate) struct Event {
    state: Mutex<bool>,
    cv: Condvar,
}

impl Event {
    pub fn new() -> Event {
        Event {
            state: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn set(&self) {
        *self.state.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn clear(&self) {
        *self.state.lock().unwrap() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Wait until set or until `timeout` elapses; returns the flag state.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while !*state {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
        true
    }
}

/// Cloneable cancellation flag for `stream_recv`/`stream_send` and friends.
/// Hand `&|| flag.is_stopped()` to the call and flip the flag from any
/// thread; the transfer breaks at its next polling window.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> StopFlag {
        StopFlag::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn event_wakes_a_waiter() {
        let ev = Arc::new(Event::new());
        let ev2 = ev.clone();
        let waiter = thread::spawn(move || ev2.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        ev.set();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn event_wait_times_out() {
        let ev = Event::new();
        assert!(!ev.wait_timeout(Duration::from_millis(10)));
        ev.set();
        assert!(ev.wait_timeout(Duration::from_millis(10)));
        ev.clear();
        assert!(!ev.is_set());
    }

    #[test]
    fn stop_flag_is_shared() {
        let flag = StopFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_stopped());
        flag.stop();
        assert!(clone.is_stopped());
    }
}
