// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![allow(dead_code)]

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::corokernel::{
    Config,
    Runtime,
};
use ::std::{
    cell::RefCell,
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Shared event log appended to by coroutines under test.
#[derive(Clone, Default)]
pub struct Journal(Rc<RefCell<Vec<String>>>);

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Creates a runtime with the default configuration.
pub fn runtime() -> Result<Runtime> {
    Ok(Runtime::new(&Config::default())?)
}

/// Creates a runtime with verbose logging and per-tick invariant checks enabled.
pub fn debug_runtime() -> Result<Runtime> {
    let config: Config = Config::parse("kernel:\n  debug: true\n")?;
    Ok(Runtime::new(&config)?)
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Journal {
    pub fn record<S: Into<String>>(&self, entry: S) {
        self.0.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}
