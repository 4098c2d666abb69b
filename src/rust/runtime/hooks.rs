// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::SharedKernel;
use ::indexmap::IndexMap;
use ::std::{
    rc::Rc,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

pub type Hook = Rc<dyn Fn(&SharedKernel)>;

/// Blocks the thread for at most the given duration, waking early if it has something to report.
pub type SleepHook = Rc<dyn Fn(&SharedKernel, Duration)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    BeforeTick,
    Tick,
    AfterTick,
    /// Runs once when the owning runtime shuts down gracefully, before the final drain.
    Terminate,
}

/// Hook lists keyed by the name of the module that installed them, in installation order.
#[derive(Default)]
pub struct Hooks {
    before_tick: IndexMap<&'static str, Hook>,
    tick: IndexMap<&'static str, Hook>,
    after_tick: IndexMap<&'static str, Hook>,
    terminate: IndexMap<&'static str, Hook>,
    sleep: IndexMap<&'static str, SleepHook>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Hooks {
    pub fn install(&mut self, kind: HookKind, owner: &'static str, hook: Hook) {
        if self.list_mut(kind).insert(owner, hook).is_some() {
            warn!("install(): replacing {:?} hook of {}", kind, owner);
        }
    }

    pub fn install_sleep(&mut self, owner: &'static str, hook: SleepHook) {
        if self.sleep.insert(owner, hook).is_some() {
            warn!("install_sleep(): replacing sleep hook of {}", owner);
        }
    }

    pub fn remove(&mut self, owner: &'static str) {
        self.before_tick.shift_remove(owner);
        self.tick.shift_remove(owner);
        self.after_tick.shift_remove(owner);
        self.terminate.shift_remove(owner);
        self.sleep.shift_remove(owner);
    }

    /// Snapshot of a hook list, so hooks may be installed or removed while the snapshot runs.
    pub fn get(&self, kind: HookKind) -> Vec<Hook> {
        self.list(kind).values().cloned().collect()
    }

    pub fn get_sleep(&self) -> Vec<SleepHook> {
        self.sleep.values().cloned().collect()
    }

    fn list(&self, kind: HookKind) -> &IndexMap<&'static str, Hook> {
        match kind {
            HookKind::BeforeTick => &self.before_tick,
            HookKind::Tick => &self.tick,
            HookKind::AfterTick => &self.after_tick,
            HookKind::Terminate => &self.terminate,
        }
    }

    fn list_mut(&mut self, kind: HookKind) -> &mut IndexMap<&'static str, Hook> {
        match kind {
            HookKind::BeforeTick => &mut self.before_tick,
            HookKind::Tick => &mut self.tick,
            HookKind::AfterTick => &mut self.after_tick,
            HookKind::Terminate => &mut self.terminate,
        }
    }
}
