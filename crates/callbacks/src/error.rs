//! Subscriber return values.

use thiserror::Error;

/// Error returned by a subscriber.
///
/// `Deregister` is not a failure: it asks the registry to drop the subscriber
/// without reporting anything to the caller of `run`. Any other error is
/// reported and also removes the subscriber.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("callback deregistered")]
    Deregister,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// The deregistration sentinel.
pub const DEREGISTER_CALLBACK: CallbackError = CallbackError::Deregister;

impl CallbackError {
    /// Wrap any error as a reportable subscriber failure.
    pub fn failed<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CallbackError::Failed(anyhow::Error::new(err))
    }

    pub fn is_deregister(&self) -> bool {
        matches!(self, CallbackError::Deregister)
    }

    /// Splits the sentinel from reportable errors.
    pub(crate) fn into_reportable(self) -> Option<anyhow::Error> {
        match self {
            CallbackError::Deregister => None,
            CallbackError::Failed(err) => Some(err),
        }
    }
}

pub type CallbackResult = Result<(), CallbackError>;
