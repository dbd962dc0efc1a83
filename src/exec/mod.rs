use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{Result, WalError};

/// Outcome of one run of a repeating task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Tick {
    /// Keep the task scheduled.
    Continue,
    /// Drop the task; it will not run again.
    Stop,
}

type OneShotFn = Box<dyn FnOnce() -> Result<()> + Send>;
type RepeatingFn = Box<dyn FnMut() -> Tick + Send>;

/// Single-threaded task executor.
///
/// One worker thread drains a FIFO queue of one-shot tasks and re-arms
/// repeating tasks on a fixed delay. One-shot submissions return a
/// [`TaskTicket`] the caller can block on; repeating tasks cancel themselves
/// by returning [`Tick::Stop`]. Handles are cheap to clone and may be shared
/// by any number of producers.
#[derive(Clone)]
pub struct SerialExecutor {
    shared: Arc<ExecShared>,
}

struct ExecShared {
    name: String,
    state: Mutex<ExecState>,
    wakeup: Condvar,
}

#[derive(Default)]
struct ExecState {
    queue: VecDeque<OneShotTask>,
    repeating: Vec<RepeatingTask>,
    shutdown: bool,
    terminated: bool,
    worker: Option<JoinHandle<()>>,
}

struct OneShotTask {
    run: OneShotFn,
    outcome: Arc<TaskOutcome>,
}

struct RepeatingTask {
    next_run: Instant,
    every: Duration,
    run: RepeatingFn,
}

struct TaskOutcome {
    slot: Mutex<Option<Result<()>>>,
    done: Condvar,
}

impl TaskOutcome {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn finish(&self, result: Result<()>) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.done.notify_all();
        }
    }
}

/// Handle to a submitted one-shot task.
pub struct TaskTicket {
    outcome: Arc<TaskOutcome>,
}

impl TaskTicket {
    /// Blocks until the task has run and returns its result. Resolves to
    /// [`WalError::Interrupted`] if the worker exited before running it.
    pub fn wait(self) -> Result<()> {
        let mut slot = self.outcome.slot.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            self.outcome.done.wait(&mut slot);
        }
    }
}

enum Work {
    One(OneShotTask),
    Repeat(RepeatingTask),
    Exit,
}

impl SerialExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        let shared = Arc::new(ExecShared {
            name: name.into(),
            state: Mutex::new(ExecState::default()),
            wakeup: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || worker_loop(worker_shared));
        shared.state.lock().worker = Some(handle);
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueues a one-shot task. Fails if the executor is shut down.
    pub fn submit(&self, run: OneShotFn) -> Result<TaskTicket> {
        let outcome = Arc::new(TaskOutcome::new());
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return Err(WalError::InvalidState("executor is shut down"));
            }
            state.queue.push_back(OneShotTask {
                run,
                outcome: Arc::clone(&outcome),
            });
        }
        self.shared.wakeup.notify_all();
        Ok(TaskTicket { outcome })
    }

    /// Schedules a repeating task. The first run happens after `initial`;
    /// later runs re-arm `every` after the previous run completes.
    pub fn schedule_repeating(
        &self,
        initial: Duration,
        every: Duration,
        run: impl FnMut() -> Tick + Send + 'static,
    ) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.repeating.push(RepeatingTask {
                next_run: Instant::now() + initial,
                every,
                run: Box::new(run),
            });
        }
        self.shared.wakeup.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Stops the worker: already-submitted one-shot tasks still run, repeating
    /// tasks cease. Waits at most `timeout` for the worker to terminate.
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        self.shared.wakeup.notify_all();
        while !state.terminated {
            if self
                .shared
                .wakeup
                .wait_until(&mut state, deadline)
                .timed_out()
                && !state.terminated
            {
                return Err(WalError::ShutdownTimeout(self.shared.name.clone()));
            }
        }
        let worker = state.worker.take();
        drop(state);
        if let Some(worker) = worker {
            let _ = worker.join();
        }
        Ok(())
    }
}

fn worker_loop(shared: Arc<ExecShared>) {
    loop {
        let work = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    break Work::One(task);
                }
                if state.shutdown {
                    break Work::Exit;
                }
                let now = Instant::now();
                if let Some(due) = state.repeating.iter().position(|t| t.next_run <= now) {
                    break Work::Repeat(state.repeating.swap_remove(due));
                }
                match state.repeating.iter().map(|t| t.next_run).min() {
                    Some(deadline) => {
                        shared.wakeup.wait_until(&mut state, deadline);
                    }
                    None => shared.wakeup.wait(&mut state),
                }
            }
        };
        match work {
            Work::Exit => break,
            Work::One(task) => {
                let result = (task.run)();
                task.outcome.finish(result);
            }
            Work::Repeat(mut task) => match (task.run)() {
                Tick::Continue => {
                    task.next_run = Instant::now() + task.every;
                    shared.state.lock().repeating.push(task);
                }
                Tick::Stop => {}
            },
        }
    }
    let mut state = shared.state.lock();
    while let Some(task) = state.queue.pop_front() {
        task.outcome.finish(Err(WalError::Interrupted));
    }
    state.repeating.clear();
    state.terminated = true;
    debug!(executor = %shared.name, "worker terminated");
    shared.wakeup.notify_all();
}
