// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::CoroutineId,
};
use ::std::{
    any::Any,
    cell::{
        Cell,
        RefCell,
    },
    mem,
    rc::Rc,
    sync::Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Why a future was rejected. Usually a [Fail], but any value is accepted.
pub type Reason = Arc<dyn Any + Send + Sync>;

/// Anything that settles exactly once and lets callers subscribe to its settlement.
pub trait Thenable {
    type Output: 'static;

    /// Registers two callbacks, exactly one of which is invoked exactly once. Implementations should invoke the
    /// matching callback right away if they are already settled.
    fn subscribe(&self, on_fulfilled: Box<dyn FnOnce(Self::Output)>, on_rejected: Box<dyn FnOnce(Reason)>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromiseStatus {
    Pending,
    Fulfilled,
    Rejected,
}

struct Subscriber<T> {
    on_fulfilled: Box<dyn FnOnce(T)>,
    on_rejected: Box<dyn FnOnce(Reason)>,
}

enum PromiseState<T> {
    Pending(Vec<Subscriber<T>>),
    Fulfilled(T),
    Rejected(Reason),
}

struct PromiseInner<T> {
    state: RefCell<PromiseState<T>>,
    /// Coroutine that produces this value, if any. Kept for diagnostics only.
    origin: Option<CoroutineId>,
    observed: Cell<bool>,
}

/// Settle-once, subscribe-many future value.
pub struct Promise<T>(Rc<PromiseInner<T>>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T: Clone + 'static> Promise<T> {
    pub fn new() -> Self {
        Self::with_state(PromiseState::Pending(Vec::new()), None)
    }

    pub(crate) fn with_origin(origin: CoroutineId) -> Self {
        Self::with_state(PromiseState::Pending(Vec::new()), Some(origin))
    }

    pub fn resolved(value: T) -> Self {
        Self::with_state(PromiseState::Fulfilled(value), None)
    }

    pub fn rejected(reason: Reason) -> Self {
        Self::with_state(PromiseState::Rejected(reason), None)
    }

    fn with_state(state: PromiseState<T>, origin: Option<CoroutineId>) -> Self {
        Self(Rc::new(PromiseInner {
            state: RefCell::new(state),
            origin,
            observed: Cell::new(false),
        }))
    }

    pub fn resolve(&self, value: T) {
        for subscriber in self.settle(PromiseState::Fulfilled(value.clone())) {
            (subscriber.on_fulfilled)(value.clone());
        }
    }

    pub fn reject(&self, reason: Reason) {
        for subscriber in self.settle(PromiseState::Rejected(reason.clone())) {
            (subscriber.on_rejected)(reason.clone());
        }
    }

    /// Stores the final state and hands back the subscribers to notify. Settling twice is a logic error.
    fn settle(&self, state: PromiseState<T>) -> Vec<Subscriber<T>> {
        let mut current = self.0.state.borrow_mut();
        if !matches!(*current, PromiseState::Pending(_)) {
            panic!("settle(): promise is already settled (origin={:?})", self.0.origin);
        }
        let subscribers: Vec<Subscriber<T>> = match mem::replace(&mut *current, state) {
            PromiseState::Pending(subscribers) => subscribers,
            _ => unreachable!("promise state was checked to be pending"),
        };
        if !subscribers.is_empty() {
            self.0.observed.set(true);
        }
        subscribers
    }

    pub fn status(&self) -> PromiseStatus {
        match &*self.0.state.borrow() {
            PromiseState::Pending(_) => PromiseStatus::Pending,
            PromiseState::Fulfilled(_) => PromiseStatus::Fulfilled,
            PromiseState::Rejected(_) => PromiseStatus::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == PromiseStatus::Pending
    }

    /// Coroutine that settles this promise, if it was created by `go`.
    pub fn origin(&self) -> Option<CoroutineId> {
        self.0.origin
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T: Clone + 'static> Thenable for Promise<T> {
    type Output = T;

    fn subscribe(&self, on_fulfilled: Box<dyn FnOnce(T)>, on_rejected: Box<dyn FnOnce(Reason)>) {
        self.0.observed.set(true);
        // Release the borrow before calling out, subscribers may touch this promise again.
        let settled: Result<T, Reason> = match &mut *self.0.state.borrow_mut() {
            PromiseState::Pending(subscribers) => {
                subscribers.push(Subscriber {
                    on_fulfilled,
                    on_rejected,
                });
                return;
            },
            PromiseState::Fulfilled(value) => Ok(value.clone()),
            PromiseState::Rejected(reason) => Err(reason.clone()),
        };
        match settled {
            Ok(value) => on_fulfilled(value),
            Err(reason) => on_rejected(reason),
        }
    }
}

impl<T: Clone + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Drop for PromiseInner<T> {
    fn drop(&mut self) {
        if let PromiseState::Rejected(reason) = &*self.state.borrow() {
            if !self.observed.get() {
                match reason.downcast_ref::<Fail>() {
                    Some(fail) => warn!("drop(): unobserved rejection (origin={:?}, error={:?})", self.origin, fail),
                    None => warn!("drop(): unobserved rejection (origin={:?})", self.origin),
                }
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Promise,
        PromiseStatus,
        Reason,
        Thenable,
    };
    use crate::runtime::fail::Fail;
    use ::anyhow::Result;
    use ::std::{
        cell::RefCell,
        rc::Rc,
        sync::Arc,
    };

    fn record(log: &Rc<RefCell<Vec<String>>>, promise: &Promise<u32>, name: &'static str) {
        let fulfilled: Rc<RefCell<Vec<String>>> = log.clone();
        let rejected: Rc<RefCell<Vec<String>>> = log.clone();
        promise.subscribe(
            Box::new(move |value: u32| fulfilled.borrow_mut().push(format!("{}:{}", name, value))),
            Box::new(move |_: Reason| rejected.borrow_mut().push(format!("{}:rejected", name))),
        );
    }

    #[test]
    fn subscribers_are_notified_in_order() -> Result<()> {
        let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let promise: Promise<u32> = Promise::new();
        record(&log, &promise, "a");
        record(&log, &promise, "b");
        crate::ensure_eq!(log.borrow().len(), 0);
        promise.resolve(7);
        crate::ensure_eq!(promise.status(), PromiseStatus::Fulfilled);
        crate::ensure_eq!(*log.borrow(), vec!["a:7".to_string(), "b:7".to_string()]);
        Ok(())
    }

    #[test]
    fn late_subscribers_fire_immediately() -> Result<()> {
        let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let promise: Promise<u32> = Promise::rejected(Arc::new(Fail::new(libc::EIO, "boom")));
        record(&log, &promise, "late");
        crate::ensure_eq!(*log.borrow(), vec!["late:rejected".to_string()]);
        crate::ensure_eq!(promise.status(), PromiseStatus::Rejected);
        Ok(())
    }

    #[test]
    #[should_panic]
    fn double_settlement_panics() {
        let promise: Promise<u32> = Promise::new();
        promise.resolve(1);
        promise.reject(Arc::new(Fail::new(libc::EIO, "too late")));
    }
}
