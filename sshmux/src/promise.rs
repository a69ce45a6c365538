//! Single-assignment completion cells with listener fan-out, used for
//! channel open, close and authentication outcomes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

/// What a [`Promise`] completed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    Value(T),
    Canceled,
}

impl<T> Outcome<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Value(v) => Some(v),
            Outcome::Canceled => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Outcome::Canceled)
    }
}

type Listener<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

enum State<T> {
    Pending {
        listeners: Vec<(u64, Listener<T>)>,
        next_id: u64,
    },
    Done(Arc<Outcome<T>>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

/// A single-assignment completion cell.
///
/// The first call to [`set`](Promise::set) (or
/// [`cancel`](Promise::cancel)) wins; later calls are ignored.
/// Listeners registered before completion run exactly once, in
/// registration order, after the value is visible; listeners registered
/// after completion run immediately. Clones share the same cell.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Promise {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending {
                    listeners: Vec::new(),
                    next_id: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn complete(&self, outcome: Outcome<T>) {
        let listeners = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            match &mut *state {
                State::Done(_) => return, // first writer wins
                State::Pending { listeners, .. } => {
                    let listeners = std::mem::take(listeners);
                    *state = State::Done(Arc::new(outcome));
                    listeners
                }
            }
        };
        // The value is visible before any listener or waiter runs.
        self.inner.notify.notify_waiters();
        if let Some(outcome) = self.peek() {
            for (_, l) in listeners {
                l(outcome.as_ref());
            }
        }
    }

    /// Complete the cell. Only the first completion takes effect.
    pub fn set(&self, value: T) {
        self.complete(Outcome::Value(value));
    }

    /// Complete the cell with the canceled sentinel.
    pub fn cancel(&self) {
        self.complete(Outcome::Canceled);
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self.inner.state.lock().as_deref(),
            Ok(State::Done(_)) | Err(_)
        )
    }

    pub fn is_canceled(&self) -> bool {
        matches!(
            self.peek().as_deref(),
            Some(Outcome::Canceled)
        )
    }

    /// The outcome, if completed.
    pub fn peek(&self) -> Option<Arc<Outcome<T>>> {
        match self.inner.state.lock().as_deref() {
            Ok(State::Done(v)) => Some(Arc::clone(v)),
            _ => None,
        }
    }

    /// Register a completion listener. Returns a token for
    /// [`remove_listener`](Promise::remove_listener); `None` means the
    /// cell was already complete and the listener has already run.
    pub fn on_complete<F>(&self, f: F) -> Option<u64>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        let done = {
            let Ok(mut state) = self.inner.state.lock() else {
                return None;
            };
            match &mut *state {
                State::Done(v) => Some(Arc::clone(v)),
                State::Pending { listeners, next_id } => {
                    let id = *next_id;
                    *next_id += 1;
                    listeners.push((id, Box::new(f)));
                    return Some(id);
                }
            }
        };
        if let Some(v) = done {
            f(&v);
        }
        None
    }

    /// Drop a pending listener. No effect once the cell completed.
    pub fn remove_listener(&self, token: u64) {
        if let Ok(mut state) = self.inner.state.lock() {
            if let State::Pending { listeners, .. } = &mut *state {
                listeners.retain(|(id, _)| *id != token);
            }
        }
    }

    /// Wait for completion. `None` on timeout; with no timeout, waits
    /// indefinitely.
    pub async fn wait(&self, timeout: Option<Duration>) -> Option<Arc<Outcome<T>>> {
        match timeout {
            Some(t) => tokio::time::timeout(t, self.wait_inner()).await.ok(),
            None => Some(self.wait_inner().await),
        }
    }

    async fn wait_inner(&self) -> Arc<Outcome<T>> {
        loop {
            // Arm the waiter before checking so a completion between the
            // check and the await is not lost.
            let notified = self.inner.notify.notified();
            if let Some(v) = self.peek() {
                return v;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn first_writer_wins() {
        let p = Promise::new();
        p.set(1);
        p.set(2);
        assert_eq!(p.peek().unwrap().value(), Some(&1));
        p.cancel();
        assert!(!p.is_canceled());
    }

    #[test]
    fn listeners_fire_exactly_once_each() {
        let p = Promise::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            p.on_complete(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        p.set(7);
        p.set(8);
        assert_eq!(count.load(Ordering::SeqCst), 3);
        // A late listener runs immediately.
        let count2 = Arc::clone(&count);
        let token = p.on_complete(move |o| {
            assert_eq!(o.value(), Some(&7));
            count2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(token.is_none());
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn removed_listener_never_fires() {
        let p = Promise::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let token = p
            .on_complete(move |_: &Outcome<u32>| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        p.remove_listener(token);
        p.set(1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wait_times_out_then_completes() {
        let p: Promise<u32> = Promise::new();
        assert!(p.wait(Some(Duration::from_millis(10))).await.is_none());
        let p2 = p.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            p2.set(5);
        });
        let got = p.wait(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(got.value(), Some(&5));
    }

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let p: Promise<u32> = Promise::new();
        let p2 = p.clone();
        tokio::spawn(async move {
            p2.cancel();
        });
        let got = p.wait(None).await.unwrap();
        assert!(got.is_canceled());
        assert!(p.is_canceled());
    }
}
