//! Typed per-request attribute storage
//!
//! Attributes are keyed by a sentinel whose static type carries the payload
//! type; two keys with the same name but different payload types do not
//! collide. The bag is shared through the pipeline behind a lock, so reads
//! clone the stored value out.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Mutex;

/// Typed key for an [`Attributes`] entry
///
/// Declare keys as constants so every site refers to the same name + type:
///
/// ```
/// use trellis_service::exchange::AttrKey;
///
/// const TENANT: AttrKey<String> = AttrKey::new("tenant");
/// ```
pub struct AttrKey<T> {
    name: &'static str,
    _type: PhantomData<fn(T)>,
}

impl<T> AttrKey<T> {
    /// Create a key with the given name
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    /// The key's name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for AttrKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AttrKey<T> {}

type AttrId = (&'static str, TypeId);

/// Typed attribute bag
///
/// Mutable throughout the pipeline. Operations take `&self`; the interior
/// lock serializes individual calls but does not make read-modify-write
/// sequences atomic; handlers coordinating across tasks must do so
/// themselves.
#[derive(Default)]
pub struct Attributes {
    inner: Mutex<HashMap<AttrId, Box<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for Attributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self
            .inner
            .lock()
            .expect("attribute lock poisoned")
            .keys()
            .map(|(name, _)| *name)
            .collect();
        f.debug_struct("Attributes").field("keys", &keys).finish()
    }
}

impl Attributes {
    /// Create an empty bag
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, returning the previous value under the same key
    pub fn insert<T: Send + Sync + 'static>(&self, key: AttrKey<T>, value: T) -> Option<T> {
        let mut map = self.inner.lock().expect("attribute lock poisoned");
        map.insert((key.name, TypeId::of::<T>()), Box::new(value))
            .and_then(|prev| prev.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    /// Clone the value stored under `key`
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: AttrKey<T>) -> Option<T> {
        let map = self.inner.lock().expect("attribute lock poisoned");
        map.get(&(key.name, TypeId::of::<T>()))
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Remove and return the value stored under `key`
    pub fn remove<T: Send + Sync + 'static>(&self, key: AttrKey<T>) -> Option<T> {
        let mut map = self.inner.lock().expect("attribute lock poisoned");
        map.remove(&(key.name, TypeId::of::<T>()))
            .and_then(|prev| prev.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    /// True when a value exists under `key`
    pub fn contains<T: 'static>(&self, key: AttrKey<T>) -> bool {
        let map = self.inner.lock().expect("attribute lock poisoned");
        map.contains_key(&(key.name, TypeId::of::<T>()))
    }

    /// Number of stored attributes
    pub fn len(&self) -> usize {
        self.inner.lock().expect("attribute lock poisoned").len()
    }

    /// True when the bag is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNT: AttrKey<u64> = AttrKey::new("count");
    const LABEL: AttrKey<String> = AttrKey::new("label");
    const SAME_NAME: AttrKey<u64> = AttrKey::new("label");

    #[test]
    fn test_insert_get_remove() {
        let attrs = Attributes::new();
        assert!(attrs.insert(COUNT, 7).is_none());
        assert_eq!(attrs.get(COUNT), Some(7));
        assert_eq!(attrs.remove(COUNT), Some(7));
        assert_eq!(attrs.get(COUNT), None);
    }

    #[test]
    fn test_insert_returns_previous() {
        let attrs = Attributes::new();
        attrs.insert(COUNT, 1);
        assert_eq!(attrs.insert(COUNT, 2), Some(1));
        assert_eq!(attrs.get(COUNT), Some(2));
    }

    #[test]
    fn test_same_name_different_type_do_not_collide() {
        let attrs = Attributes::new();
        attrs.insert(LABEL, "hello".to_string());
        attrs.insert(SAME_NAME, 42);

        assert_eq!(attrs.get(LABEL), Some("hello".to_string()));
        assert_eq!(attrs.get(SAME_NAME), Some(42));
        assert_eq!(attrs.len(), 2);
    }

    #[test]
    fn test_contains() {
        let attrs = Attributes::new();
        assert!(!attrs.contains(COUNT));
        attrs.insert(COUNT, 0);
        assert!(attrs.contains(COUNT));
    }
}
