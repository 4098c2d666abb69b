// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    str::FromStr,
    time::Duration,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Kernel options. Every option may be overridden by an environment variable named after its upper-cased key.
mod kernel_config {
    pub const SECTION_NAME: &str = "kernel";
    // Verbose logging and per-tick invariant checks.
    pub const DEBUG: &str = "debug";
    // How long a single coroutine step may run before an interrupt checkpoint yields.
    pub const INTERRUPT_BUDGET_MS: &str = "interrupt_budget_ms";
    // Upper bound on the sleep between two ticks when no module asks for less.
    pub const IDLE_TICK_MS: &str = "idle_tick_ms";
    // Sleep bound requested while only I/O watches are outstanding.
    pub const IO_IDLE_SLEEP_MS: &str = "io_idle_sleep_ms";
}

mod kernel_defaults {
    pub const INTERRUPT_BUDGET_MS: u64 = 100;
    pub const IDLE_TICK_MS: u64 = 500;
    pub const IO_IDLE_SLEEP_MS: u64 = 100;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Kernel configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        Self::parse(&config_s)
    }

    /// Parses a YAML document into a [Config] object. An empty document yields the default configuration.
    pub fn parse(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let message: String = format!("failed to parse configuration ({})", e);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            },
        };
        match &config[..] {
            [] => Ok(Self::default()),
            [c] => Ok(Self(c.clone())),
            _ => Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        }
    }

    fn get_kernel_config(&self) -> Result<Option<&Yaml>, Fail> {
        match Self::get_optional(&self.0, kernel_config::SECTION_NAME) {
            Some(section) if matches!(section, Yaml::Hash(_)) => Ok(Some(section)),
            Some(_) => {
                let message: String = format!("parameter \"{}\" has unexpected type", kernel_config::SECTION_NAME);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            None => Ok(None),
        }
    }

    /// Reads the debug toggle from the environment variable first and then the underlying configuration file.
    pub fn debug(&self) -> Result<bool, Fail> {
        if let Ok(var) = ::std::env::var(kernel_config::DEBUG.to_uppercase()) {
            return Ok(parse_flag(&var));
        }
        match self.get_kernel_config()? {
            Some(section) if Self::get_optional(section, kernel_config::DEBUG).is_some() => {
                Self::get_typed_option(section, kernel_config::DEBUG, &Yaml::as_bool)
            },
            _ => Ok(false),
        }
    }

    /// Time budget of a single coroutine step, checked by interrupt checkpoints.
    pub fn interrupt_budget(&self) -> Result<Duration, Fail> {
        self.get_duration_ms_option(kernel_config::INTERRUPT_BUDGET_MS, kernel_defaults::INTERRUPT_BUDGET_MS)
    }

    /// Longest sleep between two ticks.
    pub fn idle_tick(&self) -> Result<Duration, Fail> {
        self.get_duration_ms_option(kernel_config::IDLE_TICK_MS, kernel_defaults::IDLE_TICK_MS)
    }

    /// Sleep bound requested by the I/O multiplexer while it has outstanding watches.
    pub fn io_idle_sleep(&self) -> Result<Duration, Fail> {
        self.get_duration_ms_option(kernel_config::IO_IDLE_SLEEP_MS, kernel_defaults::IO_IDLE_SLEEP_MS)
    }

    /// Reads a millisecond option from the environment first, then the kernel section, then falls back to `default`.
    fn get_duration_ms_option(&self, index: &str, default: u64) -> Result<Duration, Fail> {
        if let Some(ms) = Self::get_typed_env_option::<u64>(index)? {
            return Ok(Duration::from_millis(ms));
        }
        let ms: u64 = match self.get_kernel_config()? {
            Some(section) if Self::get_optional(section, index).is_some() => Self::get_int_option(section, index)?,
            _ => default,
        };
        Ok(Duration::from_millis(ms))
    }

    /// Index `yaml` to find the value at `index`, if any.
    fn get_optional<'a>(yaml: &'a Yaml, index: &str) -> Option<&'a Yaml> {
        match yaml.index(index) {
            Yaml::BadValue => None,
            value => Some(value),
        }
    }

    /// Index `yaml` to find the value at `index`, validating that it exists and that the receiver returns Some(_).
    fn get_typed_option<'a, T, Fn>(yaml: &'a Yaml, index: &str, receiver: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&'a Yaml) -> Option<T>,
    {
        let option: &'a Yaml = match Self::get_optional(yaml, index) {
            Some(option) => option,
            None => {
                let message: String = format!("missing configuration option \"{}\"", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            },
        };
        match receiver(option) {
            Some(value) => Ok(value),
            None => {
                let message: String = format!("parameter {} has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Parses the environment variable named after the upper-cased `index`, if set.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        if let Ok(var) = ::std::env::var(index.to_uppercase()) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    /// Similar to `get_typed_option` using `Yaml::as_i64` as the receiver, but additionally verifies that the
    /// destination type may hold the i64 value.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<T, Fail> {
        let val: i64 = Self::get_typed_option(yaml, index, &Yaml::as_i64)?;
        match T::try_from(val) {
            Ok(val) => Ok(val),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }
}

/// Any value other than an empty string, `0`, `false`, `no` or `off` turns a flag on.
fn parse_flag(value: &str) -> bool {
    !matches!(value.trim().to_lowercase().as_str(), "" | "0" | "false" | "no" | "off")
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Config {
    fn default() -> Self {
        Self(Yaml::Null)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
