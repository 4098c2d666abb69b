// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::{
    Logger,
    LoggerHandle,
};
use ::std::{
    mem,
    sync::Once,
};

//==============================================================================
// Static Variables
//==============================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging features. The `RUST_LOG` environment variable takes precedence over the default spec.
pub fn initialize(debug: bool) {
    INIT_LOG.call_once(|| {
        let spec: &str = if debug { "debug" } else { "warn" };
        match Logger::try_with_env_or_str(spec).and_then(|logger| logger.start()) {
            // The logger lives for the remainder of the process.
            Ok(handle) => mem::forget::<LoggerHandle>(handle),
            Err(e) => eprintln!("initialize(): failed to start logger (error={:?})", e),
        }
    });
}
