// src/engine/limits.rs

use std::collections::{BTreeMap, HashMap};

use crate::config::ManagerSection;

/// Global and per-resource-class caps on running executions.
///
/// Classes without an entry in `class_limits` are only bound by the global
/// limit.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimits {
    global: usize,
    per_class: BTreeMap<String, usize>,
    running: usize,
    running_by_class: HashMap<String, usize>,
}

impl ConcurrencyLimits {
    pub fn new(global: usize, per_class: BTreeMap<String, usize>) -> Self {
        Self {
            global,
            per_class,
            running: 0,
            running_by_class: HashMap::new(),
        }
    }

    pub fn from_settings(manager: &ManagerSection) -> Self {
        Self::new(manager.max_concurrent, manager.class_limits.clone())
    }

    pub fn has_global_capacity(&self) -> bool {
        self.running < self.global
    }

    pub fn class_has_capacity(&self, class: &str) -> bool {
        match self.per_class.get(class) {
            Some(limit) => self.running_in(class) < *limit,
            None => true,
        }
    }

    pub fn acquire(&mut self, class: &str) {
        self.running += 1;
        *self.running_by_class.entry(class.to_string()).or_default() += 1;
    }

    pub fn release(&mut self, class: &str) {
        self.running = self.running.saturating_sub(1);
        if let Some(n) = self.running_by_class.get_mut(class) {
            *n = n.saturating_sub(1);
        }
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn running_in(&self, class: &str) -> usize {
        self.running_by_class.get(class).copied().unwrap_or(0)
    }
}
