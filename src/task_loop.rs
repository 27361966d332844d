//! The cooperative task loop.
//!
//! A [`TaskLoop`] owns two FIFO queues of parameterless tasks:
//! - *permanent* tasks, re-run on every tick (the reactor tick and the
//!   promise microtask drain live here), and
//! - *oneshot* tasks, run once on the next tick and discarded.
//!
//! Every runtime component registers itself on the current thread's loop,
//! obtained with [`TaskLoop::thread_loop`]. The loop is strictly
//! single-threaded; handles are cheap clones over shared queues.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;

/// A permanent task, re-run on every tick of the loop.
pub type Task = Box<dyn FnMut() -> Result<()>>;

/// A oneshot task, run on the next tick and discarded.
pub type OneshotTask = Box<dyn FnOnce() -> Result<()>>;

type SharedTask = Rc<RefCell<dyn FnMut() -> Result<()>>>;

/// Queues shared between all handles of one loop.
struct TaskLoopData {
    /// Permanent task queue, in registration order.
    permanent: RefCell<Vec<SharedTask>>,

    /// Oneshot task queue, in registration order.
    oneshot: RefCell<Vec<OneshotTask>>,
}

thread_local! {
    /// The current thread's loop, created on first use.
    static THREAD_LOOP: TaskLoop = TaskLoop::new();
}

/// A handle to a cooperative task loop.
///
/// Cloning a `TaskLoop` yields another handle to the same queues.
#[derive(Clone)]
pub struct TaskLoop {
    data: Rc<TaskLoopData>,
}

impl TaskLoop {
    /// Creates a standalone loop with empty queues.
    pub fn new() -> Self {
        Self {
            data: Rc::new(TaskLoopData {
                permanent: RefCell::new(Vec::new()),
                oneshot: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Returns a handle to the current thread's loop.
    ///
    /// The loop is created the first time this is called on a thread;
    /// subsequent calls return handles to the same loop.
    pub fn thread_loop() -> Self {
        THREAD_LOOP.with(|task_loop| task_loop.clone())
    }

    /// Appends a permanent task to the queue.
    ///
    /// The task runs on every tick, in registration order, for as long
    /// as the loop lives.
    pub fn add(&self, task: impl FnMut() -> Result<()> + 'static) {
        self.data
            .permanent
            .borrow_mut()
            .push(Rc::new(RefCell::new(task)));
    }

    /// Appends a oneshot task to the queue.
    ///
    /// The task runs once during the next tick, after all permanent
    /// tasks, and is then discarded.
    pub fn oneshot(&self, task: impl FnOnce() -> Result<()> + 'static) {
        self.data.oneshot.borrow_mut().push(Box::new(task));
    }

    /// Runs one tick of the loop.
    ///
    /// All permanent tasks run first, then all oneshot tasks captured
    /// before the tick began, each set in FIFO order. Tasks registered
    /// while the tick is running are not seen until the next tick. The
    /// first error returned by a task aborts the tick and propagates to
    /// the caller; the loop does not catch it.
    pub fn run_once(&self) -> Result<()> {
        // Snapshot both queues up front so same-tick registrations are
        // deferred to the next tick.
        let oneshot = self.data.oneshot.take();
        let n_permanent = self.data.permanent.borrow().len();

        for index in 0..n_permanent {
            let task = self.data.permanent.borrow()[index].clone();
            (&mut *task.borrow_mut())()?;
        }

        for task in oneshot {
            task()?;
        }

        Ok(())
    }

    /// Runs the loop forever.
    ///
    /// Returns only when a task fails; the error propagates unchanged.
    pub fn run(&self) -> Result<()> {
        loop {
            self.run_once()?;
        }
    }

    /// Number of registered permanent tasks.
    pub fn n_permanent_tasks(&self) -> usize {
        self.data.permanent.borrow().len()
    }

    /// Number of queued oneshot tasks.
    pub fn n_oneshot_tasks(&self) -> usize {
        self.data.oneshot.borrow().len()
    }
}

impl Default for TaskLoop {
    fn default() -> Self {
        Self::new()
    }
}
