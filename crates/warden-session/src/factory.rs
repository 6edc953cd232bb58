//! Pluggable construction and destruction of bean instances.

use std::marker::PhantomData;

use crate::error::BoxError;

/// Creates and destroys the underlying bean instances held by sessions.
///
/// Errors propagate unchanged to the caller of the cache operation.
pub trait InstanceFactory<B>: Send + Sync {
    /// Construct a new instance.
    fn create_instance(&self) -> Result<B, BoxError>;

    /// Release an instance. The default simply drops it.
    fn destroy_instance(&self, instance: B) -> Result<(), BoxError> {
        drop(instance);
        Ok(())
    }
}

/// Factory that constructs instances with [`Default`].
pub struct DefaultFactory<B>(PhantomData<fn() -> B>);

impl<B> DefaultFactory<B> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<B> Default for DefaultFactory<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Default> InstanceFactory<B> for DefaultFactory<B> {
    fn create_instance(&self) -> Result<B, BoxError> {
        Ok(B::default())
    }
}

/// Factory backed by a constructor closure.
pub struct FnFactory<F>(F);

/// Build a factory from a constructor closure.
pub fn factory_fn<B, F>(f: F) -> FnFactory<F>
where
    F: Fn() -> Result<B, BoxError> + Send + Sync,
{
    FnFactory(f)
}

impl<B, F> InstanceFactory<B> for FnFactory<F>
where
    F: Fn() -> Result<B, BoxError> + Send + Sync,
{
    fn create_instance(&self) -> Result<B, BoxError> {
        (self.0)()
    }
}
