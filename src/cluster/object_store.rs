use std::{
    collections::HashMap,
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{OrchestraError, Result};

/// A typed reference to a value held by an `ObjectStore`.
pub struct ObjectRef<T> {
    id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ObjectRef<T> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Clone for ObjectRef<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ObjectRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectRef").field(&self.id).finish()
    }
}

/// Shared immutable objects, stored serialized so every `get` yields an
/// independent copy.
#[derive(Debug, Clone, Default)]
pub struct ObjectStore {
    objects: Arc<Mutex<HashMap<u64, Arc<[u8]>>>>,
    next_id: Arc<AtomicU64>,
}

impl ObjectStore {
    /// Serializes `value` into the store.
    pub fn put<T: Serialize>(&self, value: &T) -> Result<ObjectRef<T>> {
        let bytes = serde_json::to_vec(value)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.objects.lock().insert(id, bytes.into());

        Ok(ObjectRef {
            id,
            _marker: PhantomData,
        })
    }

    /// Deserializes a fresh copy of the referenced value.
    ///
    /// # Errors
    /// `InvalidConfig` if the object was already freed.
    pub fn get<T: DeserializeOwned>(&self, object: &ObjectRef<T>) -> Result<T> {
        // Clone the blob out so the lock isn't held while deserializing.
        let bytes = self
            .objects
            .lock()
            .get(&object.id)
            .cloned()
            .ok_or_else(|| {
                OrchestraError::InvalidConfig(format!("object {} is not in the store", object.id))
            })?;

        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn free<T>(&self, object: &ObjectRef<T>) {
        self.objects.lock().remove(&object.id);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
