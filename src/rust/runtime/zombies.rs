// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    hooks::HookKind,
    scheduler::{
        CoroutineId,
        SharedCoroutine,
    },
    KernelModule,
    SharedKernel,
};
use ::indexmap::IndexMap;
use ::std::{
    cell::RefCell,
    mem,
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Coroutines waiting for the kernel to run out of other work. They are not counted as activity, so a kernel whose
/// only coroutines are buried here is idle, at which point all of them are resumed together.
#[derive(Default)]
pub struct Zombies {
    buried: RefCell<IndexMap<CoroutineId, SharedCoroutine>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Zombies {
    pub const NAME: &'static str = "core.zombies";

    pub fn len(&self) -> usize {
        self.buried.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buried.borrow().is_empty()
    }

    /// Takes a runnable coroutine out of the schedule until the kernel goes idle.
    pub fn bury(&self, kernel: &SharedKernel, coroutine: &SharedCoroutine) {
        kernel.coroutines().deactivate(kernel, coroutine);
        self.buried.borrow_mut().insert(coroutine.id(), coroutine.clone());
    }

    fn on_after_tick(&self, kernel: &SharedKernel) {
        if kernel.activity_level() > 0 || self.is_empty() {
            return;
        }
        let buried: IndexMap<CoroutineId, SharedCoroutine> = mem::take(&mut *self.buried.borrow_mut());
        trace!("on_after_tick(): resuming {} drained coroutines", buried.len());
        for coroutine in buried.values() {
            kernel.coroutines().activate(kernel, coroutine);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl KernelModule for Zombies {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn start(&self, kernel: &SharedKernel) {
        kernel.install_hook(
            HookKind::AfterTick,
            Self::NAME,
            Rc::new(|kernel: &SharedKernel| kernel.zombies().on_after_tick(kernel)),
        );
    }

    fn stop(&self, kernel: &SharedKernel) {
        kernel.remove_hooks(Self::NAME);
        let buried: IndexMap<CoroutineId, SharedCoroutine> = mem::take(&mut *self.buried.borrow_mut());
        drop(buried);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
