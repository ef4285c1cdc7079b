use std::sync::Arc;

/// A collaborator that is injected, lazily defaulted, or not yet configured.
pub(crate) enum Slot<T: ?Sized> {
    Unconfigured,
    Injected(Arc<T>),
    Defaulted(Arc<T>),
}

impl<T: ?Sized> Slot<T> {
    /// Return the configured instance, building and caching a default first if needed.
    pub(crate) fn get_or_try_init<E>(
        &mut self,
        init: impl FnOnce() -> Result<Arc<T>, E>,
    ) -> Result<Arc<T>, E> {
        match self {
            Self::Injected(value) | Self::Defaulted(value) => Ok(Arc::clone(value)),
            Self::Unconfigured => {
                let value = init()?;
                *self = Self::Defaulted(Arc::clone(&value));
                Ok(value)
            }
        }
    }

    pub(crate) fn get_or_init(&mut self, init: impl FnOnce() -> Arc<T>) -> Arc<T> {
        match self {
            Self::Injected(value) | Self::Defaulted(value) => Arc::clone(value),
            Self::Unconfigured => {
                let value = init();
                *self = Self::Defaulted(Arc::clone(&value));
                value
            }
        }
    }

    pub(crate) fn inject(&mut self, value: Arc<T>) {
        *self = Self::Injected(value);
    }

    /// Forget a default so the next access rebuilds it. Injected values stay.
    pub(crate) fn reset_default(&mut self) {
        if matches!(self, Self::Defaulted(_)) {
            *self = Self::Unconfigured;
        }
    }

    /// The value currently held, without building a default.
    pub(crate) fn current(&self) -> Option<&Arc<T>> {
        match self {
            Self::Injected(value) | Self::Defaulted(value) => Some(value),
            Self::Unconfigured => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_injected(&self) -> bool {
        matches!(self, Self::Injected(_))
    }
}
