// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::{
        CoroutineId,
        SharedCoroutine,
        Yield,
    },
    SharedKernel,
};
use ::indexmap::IndexMap;
use ::libc::{
    EAGAIN,
    EDEADLK,
};
use ::std::{
    cell::RefCell,
    mem,
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct WaitGroupState {
    counter: usize,
    waiting: IndexMap<CoroutineId, SharedCoroutine>,
}

/// Counter that releases every waiter once it drops to zero.
#[derive(Clone)]
pub struct WaitGroup {
    kernel: SharedKernel,
    state: Rc<RefCell<WaitGroupState>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl WaitGroup {
    pub fn new(kernel: &SharedKernel) -> Self {
        Self {
            kernel: kernel.clone(),
            state: Rc::new(RefCell::new(WaitGroupState {
                counter: 0,
                waiting: IndexMap::new(),
            })),
        }
    }

    /// Adjusts the counter by `delta`, clamping at zero. Reaching zero releases all waiters.
    pub fn add(&self, delta: isize) {
        let released: IndexMap<CoroutineId, SharedCoroutine> = {
            let mut state = self.state.borrow_mut();
            state.counter = match delta >= 0 {
                true => state.counter.saturating_add(delta.unsigned_abs()),
                false => state.counter.saturating_sub(delta.unsigned_abs()),
            };
            if state.counter > 0 {
                return;
            }
            mem::take(&mut state.waiting)
        };
        for coroutine in released.values() {
            self.kernel.coroutines().activate(&self.kernel, coroutine);
        }
    }

    /// Decrements the counter. Calling this on a zero counter does nothing.
    pub fn done(&self) {
        if self.count() == 0 {
            warn!("done(): wait group counter is already zero");
            return;
        }
        self.add(-1);
    }

    pub fn count(&self) -> usize {
        self.state.borrow().counter
    }

    /// Waits for the counter to reach zero. Outside a coroutine, fails with `EDEADLK` if the kernel runs out of work
    /// first.
    pub async fn wait(&self) -> Result<(), Fail> {
        if self.count() == 0 {
            return Ok(());
        }
        match self.kernel.current() {
            Some(coroutine) => {
                let id: CoroutineId = coroutine.id();
                self.kernel.coroutines().deactivate(&self.kernel, &coroutine);
                self.state.borrow_mut().waiting.insert(id, coroutine.clone());
                let resumed: Result<(), Fail> = Yield::new(coroutine).await;
                // Still registered if something other than this wait group woke us.
                self.state.borrow_mut().waiting.shift_remove(&id);
                resumed
            },
            None => match self.kernel.run_until(|| self.count() > 0) {
                Ok(()) => Ok(()),
                Err(e) if e.errno == EAGAIN => Err(Fail::new(EDEADLK, "kernel went idle with a non-zero wait group")),
                Err(e) => Err(e),
            },
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
