//! The registry: exclusive owner of all classes and hosts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::class::{ALL, Class, FARM};
use super::host::Host;

/// A class expression named a class the registry does not hold.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("no such class {0}")]
pub struct UnknownClass(pub String);

/// The global model: class table and host table, keyed by name.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Registry {
    pub classes: BTreeMap<String, Class>,
    pub hosts: BTreeMap<String, Host>,
}

impl Registry {
    /// Make sure the well-known classes exist. Returns true when something
    /// had to be created (the caller persists in that case).
    pub fn ensure_defaults(&mut self) -> bool {
        let mut changed = false;
        if !self.classes.contains_key(ALL) {
            self.classes
                .insert(ALL.to_string(), Class::atomic(ALL, "default class"));
            changed = true;
        }
        if !self.classes.contains_key(FARM) {
            self.classes
                .insert(FARM.to_string(), Class::atomic(FARM, "default reserve class"));
            changed = true;
        }
        changed
    }

    pub fn class(&self, name: &str) -> Option<&Class> {
        self.classes.get(name)
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    pub fn host_mut(&mut self, name: &str) -> Option<&mut Host> {
        self.hosts.get_mut(name)
    }

    /// Whether any of the host's classes is a resource class.
    pub fn host_is_resource(&self, host: &Host) -> bool {
        host.classes
            .iter()
            .any(|name| self.classes.get(name).is_some_and(|c| c.resource))
    }

    /// Class containment check.
    ///
    /// True when the class is one of the host's own classes, or when it is
    /// composite and every member contains the host (intersection). A
    /// non-matching atomic class is explicitly false.
    pub fn contains_host(&self, class_name: &str, host: &Host) -> bool {
        if host.classes.iter().any(|c| c == class_name) {
            return true;
        }
        match self.classes.get(class_name) {
            Some(class) if class.is_composite() => class
                .members
                .iter()
                .all(|member| self.contains_host(member, host)),
            _ => false,
        }
    }

    /// Parse a class expression: a comma-separated list of class names,
    /// whitespace tolerated. Every name must be registered. A multi-name
    /// expression acts as a transient composite over the named classes.
    pub fn resolve_expr(&self, expr: &str) -> Result<Vec<String>, UnknownClass> {
        let mut names = Vec::new();
        for part in expr.split(',') {
            let name = part.trim();
            if name.is_empty() {
                continue;
            }
            if !self.classes.contains_key(name) {
                return Err(UnknownClass(name.to_string()));
            }
            names.push(name.to_string());
        }
        if names.is_empty() {
            return Err(UnknownClass(expr.trim().to_string()));
        }
        Ok(names)
    }

    /// Whether the host matches every class in a resolved expression.
    pub fn expr_contains_host(&self, names: &[String], host: &Host) -> bool {
        names.iter().all(|name| self.contains_host(name, host))
    }
}
