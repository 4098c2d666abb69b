// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    scheduler::SharedCoroutine,
    SharedKernel,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    fmt,
    ops::Deref,
    rc::Rc,
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Identifies a registered wait.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventId(u64);

/// Callback invoked when an event fires. Receives the `extra` tag of its handler.
pub type Callback = Box<dyn FnOnce(&SharedKernel, u64)>;

/// What to do when an event fires.
pub enum Target {
    /// Reactivate a parked coroutine.
    Coroutine(SharedCoroutine),
    /// Invoke a callback outside of any coroutine.
    Callback(Callback),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Pending,
    Fired,
    Cancelled,
}

/// One registered wait, either on a timer or on an I/O watch.
pub struct EventHandler {
    id: EventId,
    target: RefCell<Option<Target>>,
    deadline: Option<Instant>,
    extra: u64,
    status: Cell<Status>,
}

#[derive(Clone)]
pub struct SharedEventHandler(Rc<EventHandler>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedEventHandler {
    pub fn new(id: EventId, target: Target, deadline: Option<Instant>, extra: u64) -> Self {
        Self(Rc::new(EventHandler {
            id,
            target: RefCell::new(Some(target)),
            deadline,
            extra,
            status: Cell::new(Status::Pending),
        }))
    }

    /// Marks the handler fired and dispatches its target.
    pub fn fire(&self, kernel: &SharedKernel) {
        match self.transition(Status::Fired) {
            Target::Coroutine(coroutine) => kernel.coroutines().activate(kernel, &coroutine),
            Target::Callback(callback) => callback(kernel, self.extra),
        }
    }

    /// Marks the handler cancelled. A parked coroutine is handed back to the scheduler, a callback is dropped.
    pub fn cancel(&self, kernel: &SharedKernel) {
        match self.transition(Status::Cancelled) {
            Target::Coroutine(coroutine) => kernel.coroutines().activate(kernel, &coroutine),
            Target::Callback(_) => {},
        }
    }

    /// Marks the handler cancelled without dispatching its target. Used when the waiter already resumed on its own.
    pub fn abandon(&self) {
        let _: Target = self.transition(Status::Cancelled);
    }

    fn transition(&self, status: Status) -> Target {
        let current: Status = self.status.get();
        if current != Status::Pending {
            panic!(
                "transition(): event {:?} cannot become {:?} (status={:?})",
                self.id, status, current
            );
        }
        self.status.set(status);
        self.target
            .borrow_mut()
            .take()
            .expect("a pending event handler should have a target")
    }
}

impl EventHandler {
    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn extra(&self) -> u64 {
        self.extra
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn is_pending(&self) -> bool {
        self.status.get() == Status::Pending
    }

    /// `Some(true)` once fired, `Some(false)` once cancelled.
    pub fn result(&self) -> Option<bool> {
        match self.status.get() {
            Status::Pending => None,
            Status::Fired => Some(true),
            Status::Cancelled => Some(false),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u64> for EventId {
    fn from(val: u64) -> Self {
        EventId(val)
    }
}

impl From<EventId> for u64 {
    fn from(val: EventId) -> Self {
        val.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Deref for SharedEventHandler {
    type Target = EventHandler;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for EventHandler {
    fn drop(&mut self) {
        if self.status.get() == Status::Pending {
            warn!("drop(): event {:?} was dropped while still pending", self.id);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
