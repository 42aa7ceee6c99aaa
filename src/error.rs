use thiserror::Error;

/// A value handed to [`WeakValueMap::set`] or [`WeakValueSet::add`] was not a
/// heap reference that can be held weakly.
///
/// Nothing is recorded when this is returned.
///
/// [`WeakValueMap::set`]: crate::WeakValueMap::set
/// [`WeakValueSet::add`]: crate::WeakValueSet::add
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{container} values must be objects, got `{type_name}`")]
pub struct InvalidValueError {
    container: &'static str,
    type_name: &'static str,
}

impl InvalidValueError {
    pub(crate) fn new<R: ?Sized>(container: &'static str) -> Self {
        Self {
            container,
            type_name: core::any::type_name::<R>(),
        }
    }

    /// Name of the collection that rejected the value.
    pub fn container(&self) -> &'static str {
        self.container
    }

    /// Rust type name of the rejected value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}
