// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    promise::{
        Reason,
        Thenable,
    },
    scheduler::{
        SharedCoroutine,
        Yield,
    },
    KernelModule,
    SharedKernel,
};
use ::libc::{
    EAGAIN,
    EDEADLK,
    EINTR,
};
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

enum Settlement<T> {
    Pending,
    Fulfilled(T),
    Rejected(Reason),
    Taken,
}

/// Bridges [Thenable] values into coroutines. Coroutines parked on a thenable count as activity.
#[derive(Default)]
pub struct Promises {}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Promises {
    pub const NAME: &'static str = "core.promises";

    /// Waits for `thenable` to settle. Inside a coroutine, parks it until then. Outside, drives the loop and fails
    /// with `EDEADLK` if the kernel runs out of work first.
    pub async fn await_thenable<Th: Thenable>(&self, kernel: &SharedKernel, thenable: &Th) -> Result<Th::Output, Fail> {
        let settlement: Rc<RefCell<Settlement<Th::Output>>> = Rc::new(RefCell::new(Settlement::Pending));
        let parked: Rc<Cell<Option<SharedCoroutine>>> = Rc::new(Cell::new(None));

        let on_fulfilled = {
            let kernel: SharedKernel = kernel.clone();
            let settlement: Rc<RefCell<Settlement<Th::Output>>> = settlement.clone();
            let parked: Rc<Cell<Option<SharedCoroutine>>> = parked.clone();
            Box::new(move |value: Th::Output| Self::wake(&kernel, &settlement, &parked, Settlement::Fulfilled(value)))
        };
        let on_rejected = {
            let kernel: SharedKernel = kernel.clone();
            let settlement: Rc<RefCell<Settlement<Th::Output>>> = settlement.clone();
            let parked: Rc<Cell<Option<SharedCoroutine>>> = parked.clone();
            Box::new(move |reason: Reason| Self::wake(&kernel, &settlement, &parked, Settlement::Rejected(reason)))
        };
        thenable.subscribe(on_fulfilled, on_rejected);

        if Self::is_pending(&settlement) {
            match kernel.current() {
                Some(coroutine) => {
                    kernel.coroutines().deactivate(kernel, &coroutine);
                    kernel.increment(Self::NAME);
                    parked.set(Some(coroutine.clone()));
                    let resumed: Result<(), Fail> = Yield::new(coroutine).await;
                    // Woken by someone else, so stop waiting.
                    if parked.take().is_some() {
                        kernel.decrement(Self::NAME);
                    }
                    resumed?;
                },
                None => match kernel.run_until(|| Self::is_pending(&settlement)) {
                    Ok(()) => {},
                    Err(e) if e.errno == EAGAIN => {
                        return Err(Fail::new(EDEADLK, "kernel went idle before the thenable settled"));
                    },
                    Err(e) => return Err(e),
                },
            }
        }

        let outcome: Settlement<Th::Output> = settlement.replace(Settlement::Taken);
        match outcome {
            Settlement::Fulfilled(value) => Ok(value),
            Settlement::Rejected(reason) => Err(Fail::from_reason(reason)),
            Settlement::Pending => {
                settlement.replace(Settlement::Pending);
                Err(Fail::new(EINTR, "coroutine resumed before the thenable settled"))
            },
            Settlement::Taken => unreachable!("settlement is only taken once"),
        }
    }

    fn is_pending<T>(settlement: &RefCell<Settlement<T>>) -> bool {
        matches!(*settlement.borrow(), Settlement::Pending)
    }

    fn wake<T>(
        kernel: &SharedKernel,
        settlement: &RefCell<Settlement<T>>,
        parked: &Cell<Option<SharedCoroutine>>,
        outcome: Settlement<T>,
    ) {
        {
            let mut state = settlement.borrow_mut();
            if !matches!(*state, Settlement::Pending) {
                panic!("wake(): thenable invoked two listeners");
            }
            *state = outcome;
        }
        if let Some(coroutine) = parked.take() {
            kernel.decrement(Self::NAME);
            kernel.coroutines().activate(kernel, &coroutine);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl KernelModule for Promises {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn start(&self, kernel: &SharedKernel) {
        kernel.register_module(Self::NAME);
    }

    fn stop(&self, kernel: &SharedKernel) {
        kernel.reset_activity(Self::NAME);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
