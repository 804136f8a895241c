//! Shared shutdown signal for one session.
//!
//! Every blocking primitive in the crate registers an unblock hook here
//! (socket shutdown, queue completion, acceptor wake-up). Raising the scope
//! runs all hooks once, so waits end natively instead of polling a flag.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{after, select, Receiver, RecvTimeoutError, Sender};

type Hook = Box<dyn FnOnce() + Send>;

struct ScopeState {
    /// Dropped on cancel; waiters see the disconnect on `raised`.
    raise: Option<Sender<()>>,
    next_id: u64,
    hooks: Vec<(u64, Hook)>,
}

impl ScopeState {
    fn cancelled(&self) -> bool {
        self.raise.is_none()
    }
}

struct Inner {
    state: Mutex<ScopeState>,
    raised: Receiver<()>,
}

impl Default for Inner {
    fn default() -> Self {
        let (raise, raised) = crossbeam_channel::bounded(0);
        Self {
            state: Mutex::new(ScopeState {
                raise: Some(raise),
                next_id: 0,
                hooks: Vec::new(),
            }),
            raised,
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle to a single cancellation signal.
#[derive(Clone, Default)]
pub struct CancellationScope {
    inner: Arc<Inner>,
}

impl CancellationScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Idempotent; hooks run on the calling thread.
    pub fn cancel(&self) {
        let hooks = {
            let mut state = self.inner.lock();
            if state.raise.take().is_none() {
                return;
            }
            std::mem::take(&mut state.hooks)
        };
        tracing::debug!(hooks = hooks.len(), "cancellation scope raised");
        for (_, hook) in hooks {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled()
    }

    /// Sleep for `timeout` unless the scope is raised first.
    /// Returns `true` when the scope is (or becomes) cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        select! {
            recv(self.inner.raised) -> _ => true,
            recv(after(timeout)) -> _ => self.is_cancelled(),
        }
    }

    /// Register `hook` to run when the scope is raised. If it already was,
    /// the hook runs immediately. Dropping the guard unregisters the hook.
    pub fn on_cancel<F>(&self, hook: F) -> CancelGuard
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.lock();
        if state.cancelled() {
            drop(state);
            hook();
            return CancelGuard {
                scope: Weak::new(),
                id: 0,
            };
        }
        let id = state.next_id;
        state.next_id += 1;
        state.hooks.push((id, Box::new(hook)));
        CancelGuard {
            scope: Arc::downgrade(&self.inner),
            id,
        }
    }
}

/// Keeps an unblock hook registered for as long as it lives.
pub struct CancelGuard {
    scope: Weak<Inner>,
    id: u64,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.scope.upgrade() {
            inner.lock().hooks.retain(|(id, _)| *id != self.id);
        }
    }
}

/// A named long-lived thread whose exit can be awaited with a deadline.
pub struct WorkerHandle {
    name: String,
    join: JoinHandle<()>,
    done: Receiver<()>,
}

impl WorkerHandle {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let (done_tx, done) = crossbeam_channel::bounded::<()>(0);
        let span = tracing::Span::current();
        let join = thread::Builder::new().name(name.clone()).spawn(move || {
            // dropped on exit, including unwinding
            let _done = done_tx;
            span.in_scope(f);
        })?;
        Ok(Self { name, join, done })
    }

    /// Wait up to `timeout` for the thread to finish. A thread that is
    /// still running afterwards is detached and `false` is returned.
    pub fn join_timeout(self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.join.join().is_err() {
                    tracing::error!(worker = %self.name, "worker thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(worker = %self.name, ?timeout, "worker did not stop in time, detaching");
                false
            }
        }
    }
}
