// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::futures::{
    future::LocalBoxFuture,
    task::noop_waker_ref,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    fmt,
    future::Future,
    ops::Deref,
    rc::Rc,
    task::{
        Context,
        Poll,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CoroutineId(u64);

/// Pushes the outcome of a finished coroutine into its promise.
pub type Settle = Box<dyn FnOnce()>;

/// Body of a running coroutine.
pub type Body = LocalBoxFuture<'static, Settle>;

/// Builds the body on the first step. Captured arguments are dropped as soon as it is called.
pub type Start = Box<dyn FnOnce() -> Body>;

enum ExecutionContext {
    NotStarted(Start),
    Suspended(Body),
    Running,
    Terminated,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoroutineStats {
    pub step_count: u64,
    pub run_time: Duration,
    pub longest_step: Duration,
}

pub struct Coroutine {
    id: CoroutineId,
    context: RefCell<ExecutionContext>,
    /// Outcome handed to the coroutine when it resumes. `Err` is raised at its suspension point.
    injected: RefCell<Option<Result<(), Fail>>>,
    step_started: Cell<Option<Instant>>,
    stats: Cell<CoroutineStats>,
}

#[derive(Clone)]
pub struct SharedCoroutine(Rc<Coroutine>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedCoroutine {
    pub fn new(id: CoroutineId, start: Start) -> Self {
        Self(Rc::new(Coroutine {
            id,
            context: RefCell::new(ExecutionContext::NotStarted(start)),
            injected: RefCell::new(None),
            step_started: Cell::new(None),
            stats: Cell::new(CoroutineStats::default()),
        }))
    }

    /// Runs the coroutine until its next suspension point. Returns the settlement of its promise once it finishes.
    pub fn resume(&self) -> Option<Settle> {
        let mut body: Body = match self.context.replace(ExecutionContext::Running) {
            ExecutionContext::NotStarted(start) => start(),
            ExecutionContext::Suspended(body) => body,
            ExecutionContext::Running => panic!("resume(): coroutine {:?} is already running", self.id),
            ExecutionContext::Terminated => panic!("resume(): coroutine {:?} has terminated", self.id),
        };

        self.begin_step();
        let mut ctx: Context = Context::from_waker(noop_waker_ref());
        let poll: Poll<Settle> = body.as_mut().poll(&mut ctx);
        self.end_step();

        match poll {
            Poll::Ready(settle) => {
                *self.context.borrow_mut() = ExecutionContext::Terminated;
                Some(settle)
            },
            Poll::Pending => {
                *self.context.borrow_mut() = ExecutionContext::Suspended(body);
                None
            },
        }
    }

    fn begin_step(&self) {
        self.step_started.set(Some(Instant::now()));
    }

    fn end_step(&self) {
        if let Some(started) = self.step_started.take() {
            let elapsed: Duration = started.elapsed();
            let mut stats: CoroutineStats = self.stats.get();
            stats.step_count += 1;
            stats.run_time += elapsed;
            stats.longest_step = stats.longest_step.max(elapsed);
            self.stats.set(stats);
        }
    }

    /// Drops the body of an unfinished coroutine along with everything it captured.
    pub fn discard(&self) {
        let context: ExecutionContext = self.context.replace(ExecutionContext::Terminated);
        drop(context);
    }

    pub fn ptr_eq(&self, other: &SharedCoroutine) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Coroutine {
    pub fn id(&self) -> CoroutineId {
        self.id
    }

    pub fn is_started(&self) -> bool {
        !matches!(*self.context.borrow(), ExecutionContext::NotStarted(_))
    }

    pub fn is_terminated(&self) -> bool {
        matches!(*self.context.borrow(), ExecutionContext::Terminated)
    }

    /// Sets what the coroutine observes when it resumes from its current suspension point.
    pub fn inject(&self, result: Result<(), Fail>) {
        if let Some(old_result) = self.injected.replace(Some(result)) {
            debug!(
                "inject(): coroutine {:?} already had a pending injection, overwriting it (old={:?})",
                self.id, old_result
            );
        }
    }

    pub fn take_injected(&self) -> Result<(), Fail> {
        self.injected.take().unwrap_or(Ok(()))
    }

    /// Time spent in the current step so far.
    pub fn step_elapsed(&self) -> Duration {
        match self.step_started.get() {
            Some(started) => started.elapsed(),
            None => Duration::ZERO,
        }
    }

    pub fn stats(&self) -> CoroutineStats {
        self.stats.get()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u64> for CoroutineId {
    fn from(val: u64) -> Self {
        CoroutineId(val)
    }
}

impl From<CoroutineId> for u64 {
    fn from(val: CoroutineId) -> Self {
        val.0
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for SharedCoroutine {
    type Target = Coroutine;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
