//! Retry scheduler bound to a single resource
//!
//! Runs one operation at a time against the owned resource on a background
//! worker thread until the operation returns [`Decision::Stop`]. Scheduling a
//! new operation replaces the pending one, so there is never more than one
//! retry loop per resource.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// What an attempt wants the scheduler to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run again after the next sleep duration
    Continue,
    /// Goal achieved or unrecoverable; drop the task
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for the next attempt
    Scheduled,
    /// An attempt is executing
    Running,
    /// Cancelled or replaced while an attempt is executing; its result is discarded
    StopRequested,
    /// No task
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// First attempt runs synchronously in the scheduling thread
    Immediate,
    /// First attempt runs on the worker after the first sleep duration
    ScheduledOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub interval: Duration,
    /// Replaces `interval` for the first wait only
    pub initial_delay: Option<Duration>,
    pub execution: Execution,
}

impl SchedulerOptions {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            initial_delay: None,
            execution: Execution::Immediate,
        }
    }

    /// Delay the first attempt instead of running it in the calling thread
    pub fn delayed(interval: Duration, initial_delay: Duration) -> Self {
        Self {
            interval,
            initial_delay: Some(initial_delay),
            execution: Execution::ScheduledOnly,
        }
    }
}

type Operation<T> = Box<dyn FnMut(&mut T) -> Decision + Send>;

struct Task<T> {
    operation: Operation<T>,
    options: SchedulerOptions,
    waits: u32,
    due: Instant,
}

impl<T> Task<T> {
    fn next_wait(&mut self) -> Duration {
        let wait = match (self.waits, self.options.initial_delay) {
            (0, Some(delay)) => delay,
            _ => self.options.interval,
        };
        self.waits = self.waits.saturating_add(1);
        wait
    }
}

struct Control<T> {
    task: Option<Task<T>>,
    state: TaskState,
    /// Bumped whenever the task is replaced or cancelled
    epoch: u64,
    shutting_down: bool,
}

impl<T> Control<T> {
    /// Drop the pending task. An attempt already executing finishes, but its result is discarded.
    fn cancel(&mut self) -> u64 {
        if self.task.take().is_some() {
            debug!("Dropping pending retry task");
        }
        self.epoch = self.epoch.wrapping_add(1);
        self.state = match self.state {
            TaskState::Running | TaskState::StopRequested => TaskState::StopRequested,
            TaskState::Scheduled | TaskState::Stopped => TaskState::Stopped,
        };
        self.epoch
    }

    /// Record the outcome of an attempt started under `epoch`
    fn finish(&mut self, epoch: u64, mut task: Task<T>, decision: Decision) {
        if epoch != self.epoch || self.shutting_down {
            debug!("Discarding result of a cancelled attempt");
            self.settle_cancelled();
            return;
        }

        match decision {
            Decision::Continue => {
                let wait = task.next_wait();
                task.due = Instant::now() + wait;
                self.task = Some(task);
                self.state = TaskState::Scheduled;
                debug!(wait_ms = wait.as_millis() as u64, "Retry scheduled");
            }
            Decision::Stop => {
                self.state = TaskState::Stopped;
                debug!("Retry loop stopped");
            }
        }
    }

    fn settle_cancelled(&mut self) {
        if self.state == TaskState::StopRequested {
            self.state = TaskState::Stopped;
        }
    }
}

/// Resource and control state are locked separately so the state stays
/// readable while an attempt holds the resource. Lock order: resource, then control.
struct Shared<T> {
    resource: Mutex<T>,
    control: Mutex<Control<T>>,
    wake: Condvar,
}

impl<T> Shared<T> {
    fn resource(&self) -> MutexGuard<'_, T> {
        self.resource.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn control(&self) -> MutexGuard<'_, Control<T>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one attempt of `task` unless it was cancelled after being taken
    fn run_attempt(&self, epoch: u64, mut task: Task<T>) {
        let mut resource = self.resource();
        {
            let mut control = self.control();
            if control.epoch != epoch || control.shutting_down {
                control.settle_cancelled();
                return;
            }
            control.state = TaskState::Running;
        }

        let decision = (task.operation)(&mut *resource);
        self.control().finish(epoch, task, decision);
        self.wake.notify_all();
    }
}

pub struct RetryScheduler<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl<T: Send + 'static> RetryScheduler<T> {
    pub fn new(resource: T) -> Self {
        let shared = Arc::new(Shared {
            resource: Mutex::new(resource),
            control: Mutex::new(Control {
                task: None,
                state: TaskState::Stopped,
                epoch: 0,
                shutting_down: false,
            }),
            wake: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("retry-scheduler".to_string())
            .spawn(move || run_worker(&worker_shared))
            .inspect_err(|e| error!(error = %e, "Failed to spawn retry scheduler thread, scheduled retries will not run"))
            .ok();

        Self { shared, worker }
    }

    /// Replace any pending task with `operation`
    pub fn schedule<F>(&self, operation: F, options: SchedulerOptions)
    where
        F: FnMut(&mut T) -> Decision + Send + 'static,
    {
        let mut task = Task {
            operation: Box::new(operation),
            options,
            waits: 0,
            due: Instant::now(),
        };

        let mut control = self.shared.control();
        let epoch = control.cancel();
        match options.execution {
            Execution::Immediate => {
                drop(control);
                // Waits for a cancelled attempt still holding the resource
                self.shared.run_attempt(epoch, task);
            }
            Execution::ScheduledOnly => {
                task.due = Instant::now() + task.next_wait();
                control.task = Some(task);
                control.state = TaskState::Scheduled;
                drop(control);
                self.shared.wake.notify_all();
            }
        }
    }

    /// Run `f` against the resource synchronously, outside the retry loop
    pub fn execute<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut *self.shared.resource())
    }

    /// Drop the pending task, wait for a running attempt to finish, then run `f`
    pub fn cancel_and_execute<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.shared.control().cancel();
        self.shared.wake.notify_all();
        f(&mut *self.shared.resource())
    }

    pub fn state(&self) -> TaskState {
        self.shared.control().state
    }
}

impl<T: Send + 'static> Drop for RetryScheduler<T> {
    fn drop(&mut self) {
        {
            let mut control = self.shared.control();
            control.shutting_down = true;
            control.cancel();
        }
        self.shared.wake.notify_all();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Retry scheduler thread panicked");
            }
        }
    }
}

fn run_worker<T>(shared: &Shared<T>) {
    let mut control = shared.control();
    loop {
        if control.shutting_down {
            break;
        }

        let Some(due) = control.task.as_ref().map(|task| task.due) else {
            control = shared.wake.wait(control).unwrap_or_else(PoisonError::into_inner);
            continue;
        };

        let now = Instant::now();
        if now < due {
            control = shared
                .wake
                .wait_timeout(control, due - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            continue;
        }

        let Some(task) = control.task.take() else {
            continue;
        };
        let epoch = control.epoch;
        drop(control);

        shared.run_attempt(epoch, task);
        control = shared.control();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SHORT: Duration = Duration::from_millis(10);

    fn wait_for(scheduler: &RetryScheduler<Vec<u32>>, state: TaskState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if scheduler.state() == state {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_immediate_runs_in_calling_thread() {
        let scheduler = RetryScheduler::new(Vec::new());
        let caller = thread::current().id();

        scheduler.schedule(
            move |log: &mut Vec<u32>| {
                assert_eq!(thread::current().id(), caller);
                log.push(1);
                Decision::Stop
            },
            SchedulerOptions::new(Duration::from_secs(60)),
        );

        // Already executed before schedule() returned
        assert_eq!(scheduler.execute(|log| log.clone()), vec![1]);
        assert_eq!(scheduler.state(), TaskState::Stopped);
    }

    #[test]
    fn test_retries_until_stop() {
        let scheduler = RetryScheduler::new(Vec::new());

        scheduler.schedule(
            |log: &mut Vec<u32>| {
                log.push(0);
                if log.len() < 4 { Decision::Continue } else { Decision::Stop }
            },
            SchedulerOptions::new(SHORT),
        );

        assert!(wait_for(&scheduler, TaskState::Stopped));
        thread::sleep(SHORT * 5);
        assert_eq!(scheduler.execute(|log| log.len()), 4);
    }

    #[test]
    fn test_scheduled_only_waits_for_initial_delay() {
        let scheduler = RetryScheduler::new(Vec::new());

        scheduler.schedule(
            |log: &mut Vec<u32>| {
                log.push(7);
                Decision::Stop
            },
            SchedulerOptions::delayed(SHORT, Duration::from_millis(200)),
        );

        assert_eq!(scheduler.state(), TaskState::Scheduled);
        assert!(scheduler.execute(|log| log.is_empty()));

        assert!(wait_for(&scheduler, TaskState::Stopped));
        assert_eq!(scheduler.execute(|log| log.clone()), vec![7]);
    }

    #[test]
    fn test_new_schedule_replaces_pending_task() {
        let scheduler = RetryScheduler::new(Vec::new());
        let old_runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&old_runs);
        scheduler.schedule(
            move |_: &mut Vec<u32>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Decision::Continue
            },
            SchedulerOptions::new(SHORT),
        );
        assert_eq!(old_runs.load(Ordering::SeqCst), 1);

        scheduler.schedule(
            |log: &mut Vec<u32>| {
                log.push(2);
                Decision::Stop
            },
            SchedulerOptions::new(SHORT),
        );

        let runs_after_replace = old_runs.load(Ordering::SeqCst);
        thread::sleep(SHORT * 10);
        assert_eq!(old_runs.load(Ordering::SeqCst), runs_after_replace);
        assert_eq!(scheduler.execute(|log| log.clone()), vec![2]);
        assert_eq!(scheduler.state(), TaskState::Stopped);
    }

    #[test]
    fn test_cancel_and_execute_drops_task() {
        let scheduler = RetryScheduler::new(Vec::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        scheduler.schedule(
            move |_: &mut Vec<u32>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Decision::Continue
            },
            SchedulerOptions::delayed(SHORT, Duration::from_millis(300)),
        );
        assert_eq!(scheduler.state(), TaskState::Scheduled);

        let len = scheduler.cancel_and_execute(|log| log.len());
        assert_eq!(len, 0);
        assert_eq!(scheduler.state(), TaskState::Stopped);

        thread::sleep(Duration::from_millis(400));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_initial_delay_only_applies_once() {
        let mut task: Task<()> = Task {
            operation: Box::new(|_: &mut ()| Decision::Stop),
            options: SchedulerOptions::delayed(SHORT, Duration::from_secs(3)),
            waits: 0,
            due: Instant::now(),
        };

        assert_eq!(task.next_wait(), Duration::from_secs(3));
        assert_eq!(task.next_wait(), SHORT);
        assert_eq!(task.next_wait(), SHORT);
    }

    #[test]
    fn test_drop_stops_worker() {
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let scheduler = RetryScheduler::new(Vec::<u32>::new());
            let counter = Arc::clone(&runs);
            scheduler.schedule(
                move |_: &mut Vec<u32>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Decision::Continue
                },
                SchedulerOptions::new(SHORT),
            );
        }

        let runs_at_drop = runs.load(Ordering::SeqCst);
        thread::sleep(SHORT * 5);
        assert_eq!(runs.load(Ordering::SeqCst), runs_at_drop);
    }

    #[test]
    fn test_running_state_visible_during_attempt() {
        let scheduler = RetryScheduler::new(Vec::new());

        scheduler.schedule(
            |log: &mut Vec<u32>| {
                thread::sleep(Duration::from_millis(300));
                log.push(1);
                Decision::Stop
            },
            SchedulerOptions::delayed(SHORT, SHORT),
        );

        assert!(wait_for(&scheduler, TaskState::Running));
        let started = Instant::now();
        assert_eq!(scheduler.state(), TaskState::Running);
        assert!(started.elapsed() < Duration::from_millis(100));

        assert!(wait_for(&scheduler, TaskState::Stopped));
        assert_eq!(scheduler.execute(|log| log.clone()), vec![1]);
    }

    #[test]
    fn test_cancel_during_attempt_requests_stop() {
        let scheduler = RetryScheduler::new(Vec::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        scheduler.schedule(
            move |_: &mut Vec<u32>| {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(300));
                Decision::Continue
            },
            SchedulerOptions::delayed(SHORT, SHORT),
        );
        assert!(wait_for(&scheduler, TaskState::Running));

        thread::scope(|scope| {
            let cancel = scope.spawn(|| scheduler.cancel_and_execute(|log| log.len()));
            assert!(wait_for(&scheduler, TaskState::StopRequested));
            assert_eq!(cancel.join().unwrap(), 0);
        });

        // The Continue from the cancelled attempt was discarded
        assert_eq!(scheduler.state(), TaskState::Stopped);
        thread::sleep(SHORT * 5);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
