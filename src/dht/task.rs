use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::debug;

use super::dispatcher::MessageDispatcher;
use super::routing::RoutingTable;
use crate::config::DhtConfig;

/// What a task sees while it runs.
pub struct TaskContext<'a> {
    pub table: &'a mut RoutingTable,
    pub dispatcher: &'a mut MessageDispatcher,
    pub config: &'a DhtConfig,
    spawned: Vec<Box<dyn Task>>,
}

impl<'a> TaskContext<'a> {
    pub fn new(
        table: &'a mut RoutingTable,
        dispatcher: &'a mut MessageDispatcher,
        config: &'a DhtConfig,
    ) -> Self {
        Self {
            table,
            dispatcher,
            config,
            spawned: Vec::new(),
        }
    }

    /// Hands a new task to the queue's periodic lane once the turn ends.
    pub fn spawn(&mut self, task: Box<dyn Task>) {
        self.spawned.push(task);
    }

    pub fn spawned(&self) -> usize {
        self.spawned.len()
    }

    fn take_spawned(&mut self) -> Vec<Box<dyn Task>> {
        std::mem::take(&mut self.spawned)
    }
}

/// A cooperative unit of background work.
///
/// Tasks never block. `startup` runs once when the task is scheduled, and
/// `resume` on every later turn until the task reports itself finished.
pub trait Task: Send {
    fn startup(&mut self, ctx: &mut TaskContext<'_>);

    fn resume(&mut self, ctx: &mut TaskContext<'_>) {
        let _ = ctx;
    }

    fn is_finished(&self) -> bool;

    /// Re-arms a recurring task before its next run.
    fn reset(&mut self) {}

    fn name(&self) -> &'static str;
}

/// Identifies a recurring task for [`TaskQueue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

struct Lane {
    pending: VecDeque<Box<dyn Task>>,
    running: Vec<Box<dyn Task>>,
    concurrency: usize,
}

impl Lane {
    fn new(concurrency: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            running: Vec::new(),
            concurrency,
        }
    }

    fn len(&self) -> usize {
        self.pending.len() + self.running.len()
    }

    fn execute(&mut self, ctx: &mut TaskContext<'_>) {
        for task in &mut self.running {
            task.resume(ctx);
        }
        self.running.retain(|task| {
            if task.is_finished() {
                debug!("Task {} finished", task.name());
            }
            !task.is_finished()
        });

        while self.running.len() < self.concurrency {
            let Some(mut task) = self.pending.pop_front() else {
                break;
            };
            task.startup(ctx);
            if task.is_finished() {
                debug!("Task {} finished on startup", task.name());
            } else {
                self.running.push(task);
            }
        }
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.running.clear();
    }
}

struct Recurring {
    handle: TaskHandle,
    task: Box<dyn Task>,
    interval: Duration,
    next_run: Instant,
    active: bool,
}

/// Cooperative scheduler for DHT maintenance.
///
/// Three collections are run on every [`execute`](Self::execute) turn:
///
/// - the immediate lane, for one-shot tasks requested by the user,
/// - the periodic lane, for one-shot tasks started by maintenance,
/// - recurring tasks, re-run on a fixed cadence until cancelled.
///
/// Both lanes start pending tasks up to their concurrency limit and drop
/// tasks once finished.
pub struct TaskQueue {
    immediate: Lane,
    periodic: Lane,
    recurring: Vec<Recurring>,
    next_handle: u64,
}

impl TaskQueue {
    pub fn new(immediate_concurrency: usize, periodic_concurrency: usize) -> Self {
        Self {
            immediate: Lane::new(immediate_concurrency),
            periodic: Lane::new(periodic_concurrency),
            recurring: Vec::new(),
            next_handle: 0,
        }
    }

    pub fn from_config(config: &DhtConfig) -> Self {
        Self::new(
            config.immediate_task_concurrency,
            config.periodic_task_concurrency,
        )
    }

    pub fn add_immediate_task(&mut self, task: Box<dyn Task>) {
        self.immediate.pending.push_back(task);
    }

    pub fn add_periodic_task1(&mut self, task: Box<dyn Task>) {
        self.periodic.pending.push_back(task);
    }

    /// Runs `task` on the next turn and then every `interval`.
    pub fn add_recurring_task(&mut self, task: Box<dyn Task>, interval: Duration) -> TaskHandle {
        let handle = TaskHandle(self.next_handle);
        self.next_handle += 1;
        self.recurring.push(Recurring {
            handle,
            task,
            interval,
            next_run: Instant::now(),
            active: false,
        });
        handle
    }

    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        let before = self.recurring.len();
        self.recurring.retain(|r| r.handle != handle);
        self.recurring.len() != before
    }

    /// Drops every task. Queries they already sent are still swept by the
    /// tracker.
    pub fn cancel_all(&mut self) {
        self.immediate.clear();
        self.periodic.clear();
        self.recurring.clear();
    }

    pub fn immediate_len(&self) -> usize {
        self.immediate.len()
    }

    pub fn periodic_len(&self) -> usize {
        self.periodic.len()
    }

    pub fn recurring_len(&self) -> usize {
        self.recurring.len()
    }

    pub fn is_idle(&self) -> bool {
        self.immediate.len() == 0 && self.periodic.len() == 0
    }

    pub fn execute(&mut self, ctx: &mut TaskContext<'_>) {
        self.execute_at(Instant::now(), ctx);
    }

    /// One scheduler turn at `now`.
    pub fn execute_at(&mut self, now: Instant, ctx: &mut TaskContext<'_>) {
        for recurring in &mut self.recurring {
            if recurring.active {
                recurring.task.resume(ctx);
            } else if now >= recurring.next_run {
                recurring.task.reset();
                recurring.task.startup(ctx);
                recurring.next_run = now + recurring.interval;
            } else {
                continue;
            }
            recurring.active = !recurring.task.is_finished();
        }

        self.immediate.execute(ctx);
        self.periodic.execute(ctx);

        for task in ctx.take_spawned() {
            debug!("Scheduling {} task", task.name());
            self.periodic.pending.push_back(task);
        }
    }
}
