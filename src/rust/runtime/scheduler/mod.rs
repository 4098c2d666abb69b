// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod coroutine;
mod coroutines;
mod yielder;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    coroutine::{
        Body,
        Coroutine,
        CoroutineId,
        CoroutineStats,
        Settle,
        SharedCoroutine,
        Start,
    },
    coroutines::{
        Coroutines,
        Microtask,
    },
    yielder::Yield,
};
