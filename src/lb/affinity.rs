//! Sticky routing by affinity key
//!
//! Methods configured with an affinity rule carry a key inside their payload.
//! `BIND` records `key -> connection` when a call completes, `BOUND` routes
//! later calls with the same key to that connection, and `UNBIND` routes
//! like `BOUND` and then drops the mapping.
//!
//! Payloads are JSON values and the key is addressed by a dotted field path.
//! A key that cannot be extracted never fails the call: routing silently
//! falls back to least-loaded selection.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

use crate::config::AffinityCommand;
use crate::pool::{ConnectionRef, PoolManager, PoolSettings, Transport};

/// Why an affinity key could not be read from a payload
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyExtractionError {
    #[error("affinity key path is empty")]
    EmptyPath,

    #[error("field {0:?} not present in payload")]
    MissingField(String),

    #[error("field {0:?} is not a string or scalar")]
    NotScalar(String),
}

/// Read the scalar at `path` ("a.b.c") out of `payload` as a string key
pub fn extract_key(payload: &Value, path: &str) -> Result<String, KeyExtractionError> {
    if path.is_empty() {
        return Err(KeyExtractionError::EmptyPath);
    }

    let mut current = payload;
    for segment in path.split('.') {
        current = current
            .get(segment)
            .ok_or_else(|| KeyExtractionError::MissingField(path.to_string()))?;
    }

    match current {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::String(_) | Value::Null => Err(KeyExtractionError::MissingField(path.to_string())),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Array(_) | Value::Object(_) => Err(KeyExtractionError::NotScalar(path.to_string())),
    }
}

/// Key to connection mapping, owned by the pool manager
#[derive(Debug)]
pub struct AffinityTable<H> {
    bindings: RwLock<HashMap<String, H>>,
}

impl<H: Clone + Eq + Hash> AffinityTable<H> {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Bind `key` to `handle`, returning the previous binding
    pub fn bind(&self, key: String, handle: H) -> Option<H> {
        self.bindings.write().insert(key, handle)
    }

    pub fn unbind(&self, key: &str) -> Option<H> {
        self.bindings.write().remove(key)
    }

    pub fn get(&self, key: &str) -> Option<H> {
        self.bindings.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }

    /// Number of keys bound to `handle`
    pub fn keys_for(&self, handle: &H) -> usize {
        self.bindings.read().values().filter(|h| *h == handle).count()
    }

    /// Re-point every key bound to `from` at `to`
    pub fn rebind(&self, from: &H, to: &H) -> usize {
        let mut moved = 0;
        for bound in self.bindings.write().values_mut() {
            if bound == from {
                *bound = to.clone();
                moved += 1;
            }
        }
        moved
    }

    /// Move `key` from `from` to `to`, or drop it when `to` is `None`.
    ///
    /// Leaves the key alone if it no longer points at `from`.
    pub fn repoint(&self, key: &str, from: &H, to: Option<H>) -> bool {
        let mut bindings = self.bindings.write();
        if bindings.get(key) != Some(from) {
            return false;
        }
        match to {
            Some(to) => {
                bindings.insert(key.to_string(), to);
            }
            None => {
                bindings.remove(key);
            }
        }
        true
    }

    /// Drop every key bound to `handle`
    pub fn forget_connection(&self, handle: &H) -> usize {
        let mut bindings = self.bindings.write();
        let before = bindings.len();
        bindings.retain(|_, bound| bound != handle);
        before - bindings.len()
    }
}

impl<H: Clone + Eq + Hash> Default for AffinityTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of consulting the affinity table for a call
#[derive(Debug)]
pub enum Route<H> {
    /// No usable binding, pick normally
    Unbound,
    /// Key bound to a READY connection
    Bound(Arc<ConnectionRef<H>>),
    /// Key bound to a connection that is not READY
    BoundNotReady,
}

/// Affinity decision for one call, kept until its completion
#[derive(Debug)]
pub struct Resolution<H> {
    pub command: AffinityCommand,

    /// Payload path of the key for this method
    pub key_path: Option<String>,

    /// Key read from the request payload, if any
    pub key: Option<String>,

    pub route: Route<H>,
}

impl<H> Resolution<H> {
    fn none() -> Self {
        Self {
            command: AffinityCommand::None,
            key_path: None,
            key: None,
            route: Route::Unbound,
        }
    }
}

/// Resolves and records affinity bindings against a pool
pub struct AffinityRouter<'a, T: Transport> {
    pool: &'a PoolManager<T>,
}

impl<'a, T: Transport> AffinityRouter<'a, T> {
    pub fn new(pool: &'a PoolManager<T>) -> Self {
        Self { pool }
    }

    /// Decide how affinity applies to a call of `method` carrying `request`
    pub fn resolve(
        &self,
        settings: &PoolSettings,
        method: &str,
        request: Option<&Value>,
    ) -> Resolution<T::Handle> {
        let Some(binding) = settings.method_binding(method) else {
            return Resolution::none();
        };

        let key = request.and_then(|payload| match extract_key(payload, &binding.affinity_key) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!(method = %method, error = %e, "Affinity key unavailable, routing normally");
                None
            }
        });

        let route = match (binding.command, key.as_deref()) {
            (AffinityCommand::Bound | AffinityCommand::Unbind, Some(k)) => self.lookup(k),
            _ => Route::Unbound,
        };

        Resolution {
            command: binding.command,
            key_path: Some(binding.affinity_key.clone()),
            key,
            route,
        }
    }

    fn lookup(&self, key: &str) -> Route<T::Handle> {
        let Some(handle) = self.pool.affinity().get(key) else {
            return Route::Unbound;
        };

        match self.pool.connection(&handle) {
            Some(conn) if conn.is_ready() => Route::Bound(conn),
            Some(conn) => {
                debug!(key = %key, connection = ?handle, state = conn.state().name(), "Bound connection not ready");
                Route::BoundNotReady
            }
            None => Route::Unbound,
        }
    }

    /// Record `key -> used`.
    ///
    /// If `used` has left the pool, whether before the insert or while it
    /// happened, the key follows its successor or is dropped. Returns whether
    /// the key ended up bound to `used`.
    pub fn bind(&self, key: String, used: &ConnectionRef<T::Handle>) -> bool {
        self.pool.affinity().bind(key.clone(), used.handle().clone());
        if !used.is_retired() {
            debug!(key = %key, connection = ?used.handle(), "Affinity bound");
            return true;
        }

        let successor = used
            .replaced_by()
            .filter(|handle| self.pool.connection(handle).is_some());
        debug!(
            key = %key,
            connection = ?used.handle(),
            successor = ?successor,
            "Bound connection already retired, re-pointing key"
        );
        self.pool.affinity().repoint(&key, used.handle(), successor);
        false
    }

    pub fn unbind(&self, key: &str) {
        if self.pool.affinity().unbind(key).is_some() {
            debug!(key = %key, "Affinity unbound");
        }
    }
}
