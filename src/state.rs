//! Shared state bag threaded through every step of a run.
//!
//! The bag carries three kinds of data:
//!
//! - **Error slot**: the first failure reported by a step. Once set, the runner
//!   executes no further forward steps.
//! - **Cancel token**: the only thread-safe member. It may be set from another
//!   thread (signal handler, UI) while a step is executing.
//! - **Typed entries**: values produced by one step and consumed by a later one,
//!   addressed through the `StateKey<T>` constants in [`keys`].
//!
//! A bag lives for exactly one run and is owned by that run; it is never shared
//! between concurrent runs.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::BuilderError;

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation flag shared between the runner and its callers.
///
/// Cloning shares the underlying flag. Setting is idempotent and permanent.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from any thread, any number of times.
    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            tracing::info!("Cancellation requested");
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Typed keys
// ============================================================================

/// Typed address of one entry in the bag.
///
/// The type parameter fixes what may be stored under the name, so `get` never
/// has to guess at a downcast.
pub struct StateKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateKey<T> {}

impl<T> fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateKey({})", self.name)
    }
}

/// Central registry of the keys steps exchange data through.
///
/// Each key documents who writes it and who reads it.
pub mod keys {
    use super::StateKey;
    use crate::api::{BlockStorage, LoginKey, PublicIp, ServerImage, ServerInstance};
    use crate::comm::ConnectTarget;

    /// Written by `StepCreateLoginKey`; read by server creation, root password
    /// lookup, SSH credentials and `StepDeleteLoginKey`.
    pub const LOGIN_KEY: StateKey<LoginKey> = StateKey::new("login_key");

    /// Written by `StepCreateServerInstance`; read by every later step that
    /// targets the instance. Removed by `StepTerminateServerInstance`.
    pub const SERVER_INSTANCE: StateKey<ServerInstance> = StateKey::new("server_instance");

    /// Written by `StepCreateBlockStorage`; removed by `StepDeleteBlockStorage`.
    pub const BLOCK_STORAGE: StateKey<BlockStorage> = StateKey::new("block_storage");

    /// Written by `StepGetRootPassword`; read by WinRM credentials.
    pub const ROOT_PASSWORD: StateKey<String> = StateKey::new("root_password");

    /// Written by `StepCreatePublicIp`; removed by `StepDeletePublicIp`.
    pub const PUBLIC_IP: StateKey<PublicIp> = StateKey::new("public_ip");

    /// Address the guest connectivity step dials. Written by `StepCreatePublicIp`.
    pub const CONNECT_HOST: StateKey<String> = StateKey::new("connect_host");

    /// Written by `StepConnect` once the guest answers; read by `StepProvision`.
    pub const CONNECT_TARGET: StateKey<ConnectTarget> = StateKey::new("connect_target");

    /// Written by `StepCreateServerImage`; read by the builder to assemble the
    /// artifact.
    pub const SERVER_IMAGE: StateKey<ServerImage> = StateKey::new("server_image");
}

// ============================================================================
// State bag
// ============================================================================

/// Mutable key/value context passed to every step.
#[derive(Default)]
pub struct StateBag {
    entries: HashMap<&'static str, Box<dyn Any + Send>>,
    error: Option<BuilderError>,
    cancel: CancelToken,
}

impl StateBag {
    /// Create an empty bag with a fresh cancel token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty bag observing an existing cancel token.
    pub fn with_cancel_token(cancel: CancelToken) -> Self {
        Self {
            entries: HashMap::new(),
            error: None,
            cancel,
        }
    }

    /// Store a value, replacing any previous value under the same key.
    pub fn put<T: Any + Send>(&mut self, key: StateKey<T>, value: T) {
        tracing::debug!("state: put {}", key.name());
        self.entries.insert(key.name(), Box::new(value));
    }

    /// Fetch a value, or `None` if the key is absent.
    pub fn get<T: Any + Send>(&self, key: StateKey<T>) -> Option<&T> {
        self.entries
            .get(key.name())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Fetch a value together with an explicit presence flag.
    pub fn get_ok<T: Any + Send>(&self, key: StateKey<T>) -> (Option<&T>, bool) {
        let value = self.get(key);
        let present = value.is_some();
        (value, present)
    }

    /// Fetch a value or fail with a `State` error naming the missing key.
    pub fn require<T: Any + Send>(&self, key: StateKey<T>) -> Result<&T, BuilderError> {
        self.get(key).ok_or_else(|| {
            BuilderError::state(format!("required state '{}' is missing", key.name()))
        })
    }

    /// Remove and return a value.
    pub fn take<T: Any + Send>(&mut self, key: StateKey<T>) -> Option<T> {
        let value = self.entries.remove(key.name())?;
        match value.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(_) => None,
        }
    }

    /// Remove a value, discarding it.
    pub fn remove<T: Any + Send>(&mut self, key: StateKey<T>) {
        self.entries.remove(key.name());
    }

    pub fn contains<T: Any + Send>(&self, key: StateKey<T>) -> bool {
        self.get(key).is_some()
    }

    /// Record a failure. The first error wins; later ones are only logged.
    pub fn put_error(&mut self, err: BuilderError) {
        match &self.error {
            Some(existing) => {
                tracing::debug!("state: ignoring error '{}' (already holding '{}')", err, existing);
            }
            None => {
                tracing::debug!("state: error slot set: {}", err);
                self.error = Some(err);
            }
        }
    }

    pub fn error(&self) -> Option<&BuilderError> {
        self.error.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn take_error(&mut self) -> Option<BuilderError> {
        self.error.take()
    }

    /// A handle to the bag's cancel token.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for StateBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&&'static str> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("StateBag")
            .field("entries", &names)
            .field("error", &self.error)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
