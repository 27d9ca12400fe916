// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{collections::HashMap, rc::Rc};

use crate::{CacheKey, EngineResource};

/// Resources that at least one holder has acquired, by key.
///
/// Entries are removed explicitly when the last reference is released, so a key present here
/// always maps to a resource with a non-zero reference count.
#[derive(Debug, Default)]
pub(crate) struct ActiveResources {
    entries: HashMap<CacheKey, Rc<EngineResource>>,
}

impl ActiveResources {
    pub(crate) fn activate(&mut self, key: CacheKey, resource: Rc<EngineResource>) {
        if let Some(previous) = self.entries.insert(key, resource) {
            // A second load of a key that skipped the registry finished while the first one is
            // still displayed; the first stays alive through its holders.
            tracing::trace!(key = %previous.key(), "replaced active resource");
        }
    }

    /// Removes `resource` if it is the one registered for its key.
    pub(crate) fn deactivate(&mut self, resource: &Rc<EngineResource>) -> bool {
        let key = resource.key();
        if self.entries.get(key).is_some_and(|current| Rc::ptr_eq(current, resource)) {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    pub(crate) fn get(&self, key: &CacheKey) -> Option<Rc<EngineResource>> {
        self.entries.get(key).map(Rc::clone)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
