//! The result of a store's compute function: a value now, or a value later.

use std::fmt::Display;
use std::future::Future;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::reactive::Setter;

/// What a compute function produced.
///
/// `Ready` values are published synchronously. `Pending` futures are spawned
/// and published when they resolve; a future resolving to `None` publishes
/// nothing, leaving the previous value in place.
pub enum Computation<T> {
    Ready(T),
    Pending(BoxFuture<'static, Option<T>>),
}

impl<T> Computation<T>
where
    T: Send + 'static,
{
    /// A value available now.
    pub fn ready(value: T) -> Self {
        Computation::Ready(value)
    }

    /// A value available once `future` resolves.
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Computation::Pending(future.map(Some).boxed())
    }

    /// A fallible future. On `Err` the error is logged and the store keeps
    /// its previous value.
    pub fn fallible<F, E>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: Display,
    {
        Computation::Pending(
            async move {
                match future.await {
                    Ok(value) => Some(value),
                    Err(err) => {
                        warn!(error = %err, "computation failed; keeping previous value");
                        None
                    }
                }
            }
            .boxed(),
        )
    }

    /// Whether the value is available without waiting.
    pub fn is_ready(&self) -> bool {
        matches!(self, Computation::Ready(_))
    }
}

impl<T> Computation<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Publish through `setter`, now or when the future resolves.
    ///
    /// `accept` is consulted just before an async result is published; it
    /// lets a store discard results it no longer wants.
    pub(crate) fn publish_to<A>(self, setter: Setter<T>, accept: A)
    where
        A: FnOnce() -> bool + Send + 'static,
    {
        match self {
            Computation::Ready(value) => setter.set(value),
            Computation::Pending(future) => {
                spawn_detached("computation", async move {
                    if let Some(value) = future.await {
                        if accept() {
                            setter.set(value);
                        }
                    }
                });
            }
        }
    }
}

impl<T> std::fmt::Debug for Computation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Computation::Ready(_) => f.write_str("Computation::Ready"),
            Computation::Pending(_) => f.write_str("Computation::Pending"),
        }
    }
}

/// Spawn `future` on the current tokio runtime.
///
/// Without a runtime the work is skipped with a warning instead of
/// panicking, so synchronous code may still read async stores.
pub(crate) fn spawn_detached<F>(task: &'static str, future: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => Some(handle.spawn(future)),
        Err(_) => {
            warn!(task, "no tokio runtime available; skipping async work");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Signal;

    #[test]
    fn ready_publishes_synchronously() {
        let signal = Signal::new(0);
        Computation::ready(3).publish_to(signal.setter(), || true);
        assert_eq!(signal.get(), 3);
    }

    #[test]
    fn pending_without_runtime_is_skipped() {
        let signal = Signal::new(0);
        let computation = Computation::pending(async { 3 });
        assert!(!computation.is_ready());

        computation.publish_to(signal.setter(), || true);
        assert_eq!(signal.get(), 0);
    }

    #[tokio::test]
    async fn failed_computation_keeps_previous_value() {
        let signal = Signal::new(1);
        Computation::fallible(async { Err::<i32, _>("backend down") })
            .publish_to(signal.setter(), || true);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(signal.get(), 1);
    }

    #[tokio::test]
    async fn rejected_result_is_discarded() {
        let signal = Signal::new(1);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        Computation::pending(async move {
            let _ = rx.await;
            2
        })
        .publish_to(signal.setter(), || false);

        let _ = tx.send(());
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        assert_eq!(signal.get(), 1);
    }
}
