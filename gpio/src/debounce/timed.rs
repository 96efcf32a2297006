use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use log::{trace, warn};
use crate::GpioResult;
use crate::debounce::DeferredWork;

#[derive(Default)]
struct WorkState {
    deadline: Option<Instant>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<WorkState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WorkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A worker thread that runs one piece of work after a delay, at most once per scheduling.
pub struct DelayedWork {
    name: String,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl DelayedWork {
    /// Spawns the worker thread. Nothing runs until the work is scheduled.
    pub fn spawn<F>(name: &str, mut work: F) -> GpioResult<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let thread_shared = shared.clone();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let shared = thread_shared;
                let mut state = shared.lock();
                while !state.shutdown {
                    match state.deadline {
                        None => {
                            state = shared.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
                        }
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                state.deadline = None;
                                drop(state);
                                work();
                                state = shared.lock();
                            } else {
                                state = shared
                                    .wake
                                    .wait_timeout(state, deadline - now)
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .0;
                            }
                        }
                    }
                }
            })?;

        Ok(Self {
            name: name.to_string(),
            shared,
            handle: Some(handle),
        })
    }

    /// Gets a handle that can schedule and cancel the work from other threads.
    pub fn handle(&self) -> WorkHandle {
        WorkHandle {
            shared: self.shared.clone(),
        }
    }

    /// Cancels pending work, waits for a run in progress to finish and stops the thread.
    ///
    /// Scheduling through a [WorkHandle] has no effect afterwards.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.deadline = None;
        }
        self.shared.wake.notify_all();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{} thread panicked.", self.name);
            }
            trace!("{} stopped.", self.name);
        }
    }
}

impl Debug for DelayedWork {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DelayedWork({})", self.name)
    }
}

impl Drop for DelayedWork {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Schedules and cancels the work of a [DelayedWork].
#[derive(Clone)]
pub struct WorkHandle {
    shared: Arc<Shared>,
}

impl Debug for WorkHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "WorkHandle")
    }
}

impl DeferredWork for WorkHandle {
    fn schedule(&self, delay: Duration) -> bool {
        let mut state = self.shared.lock();
        if state.shutdown || state.deadline.is_some() {
            return false;
        }
        state.deadline = Some(Instant::now() + delay);
        drop(state);
        self.shared.wake.notify_all();
        true
    }

    fn cancel(&self) {
        self.shared.lock().deadline = None;
        self.shared.wake.notify_all();
    }
}
