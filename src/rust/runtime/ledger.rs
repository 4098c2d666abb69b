// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::indexmap::IndexMap;
use ::std::fmt;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Per-module count of outstanding waiters. The runtime has work left as long as the sum is non-zero.
#[derive(Default)]
pub struct ActivityLedger {
    levels: IndexMap<&'static str, usize>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ActivityLedger {
    pub fn register(&mut self, module: &'static str) {
        if self.levels.insert(module, 0).is_some() {
            panic!("register(): module {} is already registered", module);
        }
    }

    pub fn increment(&mut self, module: &'static str) {
        *self.level_mut(module) += 1;
    }

    pub fn decrement(&mut self, module: &'static str) {
        let level: &mut usize = self.level_mut(module);
        if *level == 0 {
            panic!("decrement(): activity level of {} would drop below zero", module);
        }
        *level -= 1;
    }

    /// Forgets every outstanding waiter of `module`.
    pub fn reset(&mut self, module: &'static str) {
        *self.level_mut(module) = 0;
    }

    pub fn get(&self, module: &str) -> usize {
        self.levels.get(module).copied().unwrap_or_default()
    }

    pub fn sum(&self) -> usize {
        self.levels.values().sum()
    }

    fn level_mut(&mut self, module: &'static str) -> &mut usize {
        match self.levels.get_mut(module) {
            Some(level) => level,
            None => panic!("level_mut(): module {} is not registered", module),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Display for ActivityLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (module, level)) in self.levels.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}={}", module, level)?;
        }
        Ok(())
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::ActivityLedger;
    use ::anyhow::Result;

    #[test]
    fn sum_tracks_all_modules() -> Result<()> {
        let mut ledger: ActivityLedger = ActivityLedger::default();
        ledger.register("a");
        ledger.register("b");
        ledger.increment("a");
        ledger.increment("b");
        ledger.increment("b");
        crate::ensure_eq!(ledger.sum(), 3);
        crate::ensure_eq!(ledger.get("b"), 2);
        ledger.decrement("b");
        ledger.reset("a");
        crate::ensure_eq!(ledger.sum(), 1);
        crate::ensure_eq!(ledger.to_string(), "a=0 b=1".to_string());
        Ok(())
    }

    #[test]
    #[should_panic]
    fn decrement_below_zero_panics() {
        let mut ledger: ActivityLedger = ActivityLedger::default();
        ledger.register("a");
        ledger.decrement("a");
    }

    #[test]
    #[should_panic]
    fn unknown_module_panics() {
        let mut ledger: ActivityLedger = ActivityLedger::default();
        ledger.increment("a");
    }
}
