//! A value that is set exactly once and can be waited on from any thread.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
pub(crate) struct Slot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    pub(crate) fn filled(value: T) -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(Some(value)),
            ready: Condvar::new(),
        })
    }

    /// Stores the value and wakes every waiter.
    ///
    /// # Panics
    ///
    /// Panics if the slot was already set.
    pub(crate) fn set(&self, value: T) {
        let mut guard = self.value.lock();
        assert!(guard.is_none(), "slot completed twice");
        *guard = Some(value);
        self.ready.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        self.value.lock().is_some()
    }

    /// Blocks until the value is set, then runs `f` on it.
    pub(crate) fn wait_with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let mut guard = self.value.lock();
        loop {
            if let Some(value) = guard.as_ref() {
                return f(value);
            }
            self.ready.wait(&mut guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn wait_sees_value_set_later() {
        let slot = Slot::<u32>::new();
        let setter = slot.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.set(7);
        });
        assert_eq!(slot.wait_with(|v| *v), 7);
        assert!(slot.is_set());
        handle.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "slot completed twice")]
    fn set_twice_panics() {
        let slot = Slot::filled(1);
        slot.set(2);
    }
}
