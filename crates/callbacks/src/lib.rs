//! Callback registries for lifecycle and message events.
//!
//! Two dispatch disciplines share one subscriber contract: return `Ok` to stay
//! registered, the [`DEREGISTER_CALLBACK`] sentinel to be removed quietly, or
//! any other error to be removed and have the error reported to the caller.
//!
//! - [`SequentialCallbackManager`]: broadcast, every subscriber sees the same
//!   parameters.
//! - [`ReduceCallbackManager`]: pipeline, each subscriber transforms an
//!   accumulator handed to the next.

pub mod error;
pub mod reduce;
pub mod sequential;

pub use error::{CallbackError, CallbackResult, DEREGISTER_CALLBACK};
pub use reduce::{ReduceCallbackManager, WeakReduceCallbackManager};
pub use sequential::{SequentialCallbackManager, WeakSequentialCallbackManager};
