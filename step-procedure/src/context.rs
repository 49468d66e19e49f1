use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use thiserror::Error;

/// A typed token naming one entry of a [`StateBag`].
///
/// Keys are declared once as constants and shared between the step that writes
/// the value and the steps that read it:
///
/// ```ignore
/// pub const RESOURCE_GROUP: Key<String> = Key::new("resource_group");
/// ```
pub struct Key<T> {
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _value: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.name)
    }
}

/// A required value was read before any step wrote it.
#[derive(Debug, Error)]
#[error("missing required state key '{0}'")]
pub struct MissingKey(pub &'static str);

/// Cloneable handle to the cancellation flag of a [`StateBag`].
///
/// Hand this to whatever observes user interrupts; the bag itself never
/// installs signal handlers.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type Value = Box<dyn Any + Send + Sync>;

/// Shared state of a single build run.
///
/// Values are written by earlier steps and read by later steps and by cleanup.
/// All methods take `&self` so a [`CancelHandle`] can flip the flag from another
/// task while a step holds a reference to the bag.
pub struct StateBag {
    values: RwLock<HashMap<&'static str, Value>>,
    error: OnceLock<String>,
    cancel: CancelHandle,
}

impl Default for StateBag {
    fn default() -> Self {
        Self::new()
    }
}

impl StateBag {
    pub fn new() -> Self {
        Self::with_cancel(CancelHandle::new())
    }

    /// Create a bag observing an existing cancellation flag
    pub fn with_cancel(cancel: CancelHandle) -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            error: OnceLock::new(),
            cancel,
        }
    }

    /// Store `value`, replacing any previous value for `key`
    pub fn put<T: Any + Send + Sync>(&self, key: Key<T>, value: T) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.name, Box::new(value));
    }

    /// Read a value a previous step is known to have written.
    ///
    /// # Panics
    /// Panics with [`MissingKey`] when the key was never written, or when it holds
    /// a value of another type. Both mean the step list is composed wrongly.
    #[track_caller]
    pub fn get<T: Any + Clone>(&self, key: Key<T>) -> T {
        match self.try_get(key) {
            Some(v) => v,
            None => panic!("{}", MissingKey(key.name)),
        }
    }

    /// Read a value that may legitimately be absent.
    ///
    /// # Panics
    /// Panics when the key holds a value of another type.
    #[track_caller]
    pub fn try_get<T: Any + Clone>(&self, key: Key<T>) -> Option<T> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        let value = values.get(key.name)?;
        match value.downcast_ref::<T>() {
            Some(v) => Some(v.clone()),
            None => panic!(
                "state key '{}' holds a value of a different type than {}",
                key.name,
                std::any::type_name::<T>()
            ),
        }
    }

    pub fn contains<T>(&self, key: Key<T>) -> bool {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key.name)
    }

    /// Remove a value, returning it if it was present with the expected type
    pub fn remove<T: Any>(&self, key: Key<T>) -> Option<T> {
        let removed = self
            .values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key.name)?;
        removed.downcast::<T>().ok().map(|v| *v)
    }

    pub fn request_cancellation(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Record the error that stopped the run.
    ///
    /// Only the first call has an effect; returns `true` when this call recorded.
    pub fn record_error(&self, error: impl fmt::Display) -> bool {
        self.error.set(error.to_string()).is_ok()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.get().map(String::as_str)
    }
}

impl fmt::Debug for StateBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<_> = values.keys().copied().collect();
        keys.sort_unstable();
        f.debug_struct("StateBag")
            .field("keys", &keys)
            .field("error", &self.error.get())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
