// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::promise::Reason;
use ::libc::{
    c_int,
    EIO,
    ENOTRECOVERABLE,
    EPROTO,
};
use ::std::{
    any::Any,
    error,
    fmt,
    io,
};

//==============================================================================
// Structures
//==============================================================================

/// Failure
#[derive(Clone)]
pub struct Fail {
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
    /// Original rejection reason, when a future settled with something other than a [Fail].
    pub reason: Option<Reason>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate Functions for Failures
impl Fail {
    /// Creates a new Failure
    pub fn new(errno: i32, cause: &str) -> Self {
        Self {
            errno,
            cause: cause.to_string(),
            reason: None,
        }
    }

    /// Creates a failure that carries a rejection reason which is not an error value.
    pub fn rejected(reason: Reason) -> Self {
        Self {
            errno: EPROTO,
            cause: "future was rejected without an error value".to_string(),
            reason: Some(reason),
        }
    }

    /// Converts a rejection reason into a failure, re-raising it as-is if it already is one.
    pub fn from_reason(reason: Reason) -> Self {
        match reason.downcast::<Fail>() {
            Ok(fail) => (*fail).clone(),
            Err(reason) => Self::rejected(reason),
        }
    }

    /// Creates a failure out of the payload of a caught panic, keeping its message when it has one.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message: &str = match payload.downcast_ref::<&str>() {
            Some(message) => *message,
            None => match payload.downcast_ref::<String>() {
                Some(message) => message.as_str(),
                None => "unknown panic",
            },
        };
        Self::new(ENOTRECOVERABLE, &format!("coroutine panicked: {}", message))
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Display Trait Implementation for Failures
impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Debug trait Implementation for Failures
impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {:?}: {:?}", self.errno, self.cause)
    }
}

/// Error Trait Implementation for Failures
impl error::Error for Fail {}

/// Conversion Trait Implementation for Fail
impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        Self {
            errno: e.raw_os_error().unwrap_or(EIO),
            cause: e.to_string(),
            reason: None,
        }
    }
}

/// Conversion Trait Implementation for I/O Errors
impl From<Fail> for io::Error {
    fn from(fail: Fail) -> Self {
        io::Error::new(io::Error::from_raw_os_error(fail.errno).kind(), fail.cause)
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
