//! Opaque error carriage for promises and generators.
//!
//! Rejections and injected generator errors travel through the runtime
//! as a [`CapturedError`]: a shared, cloneable handle over an
//! [`anyhow::Error`] that keeps the original dynamic type downcastable.
//! Typed rejection handlers downcast the captured error; a mismatch
//! surfaces as [`BadCast`].

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Raised when a typed rejection handler expects one error type but the
/// captured error holds another.
#[derive(Debug, Clone, Error)]
#[error("captured error type does not match the handler's expected type")]
pub struct BadCast;

/// A captured error in flight through the runtime.
///
/// Cloning shares the underlying error. Converting to and from
/// [`anyhow::Error`] round-trips without burying the original type
/// behind wrapper layers.
#[derive(Clone)]
pub struct CapturedError(Arc<anyhow::Error>);

impl CapturedError {
    /// Captures an error.
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self::from_anyhow(error.into())
    }

    /// Captures an [`anyhow::Error`], unwrapping a re-captured handle
    /// instead of nesting it.
    pub(crate) fn from_anyhow(error: anyhow::Error) -> Self {
        match error.downcast::<CapturedError>() {
            Ok(captured) => captured,
            Err(other) => CapturedError(Arc::new(other)),
        }
    }

    /// Converts back into an [`anyhow::Error`].
    ///
    /// A uniquely held capture gives back the original error; a shared
    /// one is wrapped (and unwrapped again by [`from_anyhow`]).
    ///
    /// [`from_anyhow`]: Self::from_anyhow
    pub fn into_anyhow(self) -> anyhow::Error {
        match Arc::try_unwrap(self.0) {
            Ok(error) => error,
            Err(shared) => anyhow::Error::new(CapturedError(shared)),
        }
    }

    /// Attempts to view the captured error as a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Whether the captured error is of the given concrete type.
    pub fn is<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for CapturedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + Send + Sync + 'static) = self.0.as_ref().as_ref();
        Some(inner)
    }
}
