// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::SharedCoroutine,
};
use ::std::{
    future::Future,
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Yield is a future that hands control from the running coroutine back to the scheduler exactly once. Whoever parked
/// the coroutine decides when it is stepped again; on resumption the future completes with the value injected into the
/// coroutine, if any.
pub struct Yield {
    coroutine: SharedCoroutine,
    already_yielded: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Yield {
    pub fn new(coroutine: SharedCoroutine) -> Self {
        Self {
            coroutine,
            already_yielded: false,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Future for Yield {
    type Output = Result<(), Fail>;

    /// Polls the underlying operation.
    fn poll(self: Pin<&mut Self>, _context: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();
        if self_.already_yielded {
            return Poll::Ready(self_.coroutine.take_injected());
        }
        self_.already_yielded = true;
        Poll::Pending
    }
}
