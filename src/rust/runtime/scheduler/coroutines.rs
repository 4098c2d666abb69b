// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    hooks::HookKind,
    scheduler::{
        CoroutineId,
        Settle,
        SharedCoroutine,
    },
    KernelModule,
    SharedKernel,
};
use ::indexmap::IndexMap;
use ::std::{
    cell::RefCell,
    collections::HashMap,
    mem,
    rc::Rc,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Work queued by a coroutine step, run right after that step and before the next coroutine is stepped.
pub type Microtask = Box<dyn FnOnce(&SharedKernel) -> Result<(), Fail>>;

/// Owns runnable coroutines and steps each of them once per tick.
#[derive(Default)]
pub struct Coroutines {
    current: RefCell<Option<SharedCoroutine>>,
    /// Runnable coroutines, in the order they became runnable.
    active: RefCell<IndexMap<CoroutineId, SharedCoroutine>>,
    /// Every coroutine that was added and has not terminated, wherever it is parked.
    added: RefCell<HashMap<CoroutineId, SharedCoroutine>>,
    microtasks: RefCell<Vec<Microtask>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Coroutines {
    pub const NAME: &'static str = "core.coroutines";

    /// Coroutine whose step is in progress, if any.
    pub fn current(&self) -> Option<SharedCoroutine> {
        self.current.borrow().clone()
    }

    /// Number of runnable coroutines.
    pub fn len(&self) -> usize {
        self.active.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.borrow().is_empty()
    }

    pub fn is_active(&self, id: CoroutineId) -> bool {
        self.active.borrow().contains_key(&id)
    }

    /// Registers a new coroutine and steps it once before returning.
    pub fn add(&self, kernel: &SharedKernel, coroutine: SharedCoroutine) {
        let id: CoroutineId = coroutine.id();
        if self.added.borrow_mut().insert(id, coroutine.clone()).is_some() {
            panic!("add(): coroutine {:?} was already added", id);
        }
        self.active.borrow_mut().insert(id, coroutine.clone());
        kernel.increment(Self::NAME);
        kernel.set_max_delay(Duration::ZERO);
        trace!("add(): coroutine {:?}", id);

        // The caller may itself be a coroutine halfway through its step.
        let previous: Option<SharedCoroutine> = self.current.take();
        let microtasks: Vec<Microtask> = mem::take(&mut *self.microtasks.borrow_mut());
        self.step(kernel, &coroutine);
        *self.microtasks.borrow_mut() = microtasks;
        *self.current.borrow_mut() = previous;
    }

    /// Makes a parked coroutine runnable again.
    pub fn activate(&self, kernel: &SharedKernel, coroutine: &SharedCoroutine) {
        let id: CoroutineId = coroutine.id();
        if !self.added.borrow().contains_key(&id) {
            panic!("activate(): coroutine {:?} is not managed by this kernel", id);
        }
        if self.active.borrow_mut().insert(id, coroutine.clone()).is_some() {
            panic!("activate(): coroutine {:?} is already runnable", id);
        }
        kernel.increment(Self::NAME);
        kernel.set_max_delay(Duration::ZERO);
    }

    /// Makes a parked coroutine runnable again and has it observe `result` at its suspension point.
    pub fn activate_with(&self, kernel: &SharedKernel, coroutine: &SharedCoroutine, result: Result<(), Fail>) {
        coroutine.inject(result);
        self.activate(kernel, coroutine);
    }

    /// Takes a runnable coroutine out of the schedule. The caller becomes responsible for activating it again.
    pub fn deactivate(&self, kernel: &SharedKernel, coroutine: &SharedCoroutine) {
        let id: CoroutineId = coroutine.id();
        if self.active.borrow_mut().shift_remove(&id).is_none() {
            panic!("deactivate(): coroutine {:?} is not runnable", id);
        }
        kernel.decrement(Self::NAME);
    }

    pub fn queue_microtask(&self, task: Microtask) {
        self.microtasks.borrow_mut().push(task);
    }

    fn step(&self, kernel: &SharedKernel, coroutine: &SharedCoroutine) {
        *self.current.borrow_mut() = Some(coroutine.clone());
        let settle: Option<Settle> = coroutine.resume();
        *self.current.borrow_mut() = None;
        if let Some(settle) = settle {
            self.terminated(kernel, coroutine);
            settle();
        }
        self.run_microtasks(kernel);
    }

    fn terminated(&self, kernel: &SharedKernel, coroutine: &SharedCoroutine) {
        let id: CoroutineId = coroutine.id();
        if self.active.borrow_mut().shift_remove(&id).is_none() {
            panic!("terminated(): coroutine {:?} finished while parked", id);
        }
        kernel.decrement(Self::NAME);
        self.added.borrow_mut().remove(&id);
        trace!("terminated(): coroutine {:?} (stats={:?})", id, coroutine.stats());
    }

    fn run_microtasks(&self, kernel: &SharedKernel) {
        loop {
            let tasks: Vec<Microtask> = mem::take(&mut *self.microtasks.borrow_mut());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                if let Err(e) = task(kernel) {
                    warn!("run_microtasks(): microtask failed (error={:?})", e);
                }
            }
        }
    }

    fn on_tick(&self, kernel: &SharedKernel) {
        // Coroutines that become runnable during this pass wait for the next tick.
        let runnable: Vec<SharedCoroutine> = self.active.borrow().values().cloned().collect();
        for coroutine in runnable {
            if self.is_active(coroutine.id()) {
                self.step(kernel, &coroutine);
            }
        }
    }

    fn on_after_tick(&self, kernel: &SharedKernel) {
        if !self.is_empty() {
            kernel.set_max_delay(Duration::ZERO);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl KernelModule for Coroutines {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn start(&self, kernel: &SharedKernel) {
        kernel.register_module(Self::NAME);
        kernel.install_hook(
            HookKind::Tick,
            Self::NAME,
            Rc::new(|kernel: &SharedKernel| kernel.coroutines().on_tick(kernel)),
        );
        kernel.install_hook(
            HookKind::AfterTick,
            Self::NAME,
            Rc::new(|kernel: &SharedKernel| kernel.coroutines().on_after_tick(kernel)),
        );
    }

    fn stop(&self, kernel: &SharedKernel) {
        kernel.remove_hooks(Self::NAME);
        kernel.reset_activity(Self::NAME);
        // Drop outside of the borrows, coroutine bodies may call back into the kernel while being destroyed.
        let active: IndexMap<CoroutineId, SharedCoroutine> = mem::take(&mut *self.active.borrow_mut());
        let microtasks: Vec<Microtask> = mem::take(&mut *self.microtasks.borrow_mut());
        let current: Option<SharedCoroutine> = self.current.take();
        let added: HashMap<CoroutineId, SharedCoroutine> = mem::take(&mut *self.added.borrow_mut());
        drop(active);
        drop(microtasks);
        drop(current);
        // Unfinished bodies hold their own coroutine, so the cycle has to be broken by hand.
        for coroutine in added.values() {
            coroutine.discard();
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
