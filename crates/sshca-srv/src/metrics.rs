//! Process counters exported at `/metrics` in the Prometheus text format.
//!
//! Every counter is labelled by `module`: the provider name for the auth
//! counters, the front end (`http`, `ssh`) for errors.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// A monotonically increasing counter split by a `module` label.
#[derive(Debug)]
pub struct CounterVec {
    name: &'static str,
    help: &'static str,
    values: Mutex<BTreeMap<String, u64>>,
}

impl CounterVec {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            values: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn inc(&self, module: &str) {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        *values.entry(module.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, module: &str) -> u64 {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.get(module).copied().unwrap_or(0)
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        for (module, count) in values.iter() {
            let _ = writeln!(out, "{}{{module=\"{}\"}} {count}", self.name, escape_label(module));
        }
    }
}

/// Counters shared by the HTTP and SSH front ends.
#[derive(Debug)]
pub struct Metrics {
    pub auth_valid: CounterVec,
    pub auth_exchange: CounterVec,
    pub errors: CounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            auth_valid: CounterVec::new("sshca_auth_valid_total", "Auth Valid calls"),
            auth_exchange: CounterVec::new("sshca_auth_exchange_total", "Auth Exchange calls"),
            errors: CounterVec::new("sshca_sys_error_total", "Error counts by module"),
        }
    }

    /// Render every counter in the text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.auth_valid.render(&mut out);
        self.auth_exchange.render(&mut out);
        self.errors.render(&mut out);
        out
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
