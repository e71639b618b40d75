//! Runtime components
//!
//! By default, the `runtime` feature wires in the [tokio](https://tokio.rs) runtime.
//!
//! If the `runtime` feature is disabled, the types in this module can be used
//! to plug in other runtimes.

mod timer;
pub mod io;
#[cfg(feature = "runtime")]
pub mod tokio;

pub use io::{Read, ReadBuf, ReadBufCursor, Write};
pub use timer::{Sleep, Timer};
#[cfg(feature = "runtime")]
pub use tokio::TokioIo;

/// An executor of futures.
///
/// This trait allows this crate to abstract over async runtimes. Implement this trait for your own type.
///
/// # Example
///
/// ```
/// # use traffic_arbiter::rt::Executor;
/// # use std::future::Future;
/// #[derive(Clone)]
/// struct TokioExecutor;
///
/// impl<F> Executor<F> for TokioExecutor
/// where
///     F: Future + Send + 'static,
///     F::Output: Send + 'static,
/// {
///     fn execute(&self, future: F) {
///         tokio::spawn(future);
///     }
/// }
/// ```
pub trait Executor<Fut> {
    /// Place the future into the executor to be run.
    fn execute(&self, fut: Fut);
}
