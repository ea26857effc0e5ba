//! Per-runtime module cache, keyed by resource name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::values::{ReferenceState, ValueRef};

struct CacheInner {
    modules: HashMap<String, ValueRef>,
    sealed: bool,
}

/// Values removed from the cache are returned, never dropped under its lock.
pub(crate) struct ModuleCache {
    inner: Mutex<CacheInner>,
}

impl ModuleCache {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                modules: HashMap::new(),
                sealed: false,
            }),
        }
    }

    /// Store `module` under `name` and return whatever it replaced.
    pub(crate) fn insert(&self, name: String, module: ValueRef) -> Result<Option<ValueRef>> {
        let mut inner = self.inner.lock().expect("module cache poisoned");
        if inner.sealed {
            return Err(Error::RuntimeClosed);
        }
        Ok(inner.modules.insert(name, module))
    }

    pub(crate) fn get(&self, name: &str) -> Option<ValueRef> {
        self.inner
            .lock()
            .expect("module cache poisoned")
            .modules
            .get(name)
            .cloned()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.inner
            .lock()
            .expect("module cache poisoned")
            .modules
            .contains_key(name)
    }

    pub(crate) fn remove(&self, name: &str) -> Option<ValueRef> {
        self.inner
            .lock()
            .expect("module cache poisoned")
            .modules
            .remove(name)
    }

    /// Evict the entry that wraps `state`, if any.
    pub(crate) fn remove_state(&self, state: &Arc<ReferenceState>) -> Option<ValueRef> {
        let mut inner = self.inner.lock().expect("module cache poisoned");
        let name = inner
            .modules
            .iter()
            .find(|(_, module)| Arc::ptr_eq(module.state(), state))
            .map(|(name, _)| name.clone())?;
        inner.modules.remove(&name)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("module cache poisoned").modules.len()
    }

    pub(crate) fn drain(&self, seal: bool) -> Vec<(String, ValueRef)> {
        let mut inner = self.inner.lock().expect("module cache poisoned");
        if seal {
            inner.sealed = true;
        }
        inner.modules.drain().collect()
    }
}
