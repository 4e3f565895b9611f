use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

/// Activity-stream objects declared by clients, keyed by their `id`.
///
/// Entries live until the process exits. Re-declaring an id replaces its
/// entry, so the map holds one object per distinct id ever declared.
#[derive(Default)]
pub struct ActivityObjectRegistry {
    objects: Mutex<HashMap<String, Value>>,
}

impl ActivityObjectRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `object` under `id`, returning the object it replaced.
    pub fn put(&self, id: &str, object: Value) -> Option<Value> {
        self.lock().insert(id.to_owned(), object)
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<Value> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}
