//! Process environment access behind an injectable interface.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Read/write access to environment variables.
pub trait Environment: Send + Sync {
    /// Current value of `name`, if set and valid UTF-8.
    fn var(&self, name: &str) -> Option<String>;

    /// Set `name` to `value`.
    fn set_var(&self, name: &str, value: &str);

    /// Unset `name`.
    fn remove_var(&self, name: &str);
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn set_var(&self, name: &str, value: &str) {
        std::env::set_var(name, value);
    }

    fn remove_var(&self, name: &str) {
        std::env::remove_var(name);
    }
}

/// In-memory environment for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryEnv {
    vars: Mutex<HashMap<String, String>>,
}

impl MemoryEnv {
    /// Empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment seeded with `vars`.
    #[must_use]
    pub fn with_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: Mutex::new(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect()),
        }
    }
}

impl Environment for MemoryEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn set_var(&self, name: &str, value: &str) {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), value.to_owned());
    }

    fn remove_var(&self, name: &str) {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}
