//! Single-shot reply mailboxes.
//!
//! Both sequence-number pools (the USB transport's 256 slots and each
//! device's 32 slots) pair a reserved sequence number with a mailbox: the
//! receive worker deposits the decoded reply, the issuing thread waits on it.
//! A mailbox is filled at most once; later deposits for the same slot are
//! ignored (the first response wins, duplicates are retransmission echoes).

use crate::util;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub(crate) struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    filled: Condvar,
}

impl<T: Clone> Mailbox<T> {
    pub fn new() -> Self {
        Mailbox {
            slot: Mutex::new(None),
            filled: Condvar::new(),
        }
    }

    /// Deposits a value and wakes all waiters. The first deposit wins.
    pub fn put(&self, value: T) {
        let mut slot = util::lock(&self.slot);
        if slot.is_none() {
            *slot = Some(value);
            self.filled.notify_all();
        }
    }

    /// Returns whether a value has been deposited.
    pub fn is_filled(&self) -> bool {
        util::lock(&self.slot).is_some()
    }

    /// Waits up to `timeout` for a value and returns a copy of it.
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = util::lock(&self.slot);
        loop {
            if let Some(value) = slot.as_ref() {
                return Some(value.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .filled
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            slot = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_deposited_value() {
        let mb = Arc::new(Mailbox::new());
        let writer = {
            let mb = mb.clone();
            thread::spawn(move || mb.put(42u32))
        };
        assert_eq!(mb.wait(Duration::from_secs(5)), Some(42));
        assert!(mb.is_filled());
        writer.join().unwrap();
    }

    #[test]
    fn wait_times_out_when_empty() {
        let mb: Mailbox<u32> = Mailbox::new();
        assert_eq!(mb.wait(Duration::from_millis(10)), None);
        assert!(!mb.is_filled());
    }

    #[test]
    fn first_deposit_wins() {
        let mb = Mailbox::new();
        mb.put(1u32);
        mb.put(2);
        assert_eq!(mb.wait(Duration::from_millis(1)), Some(1));
    }
}
