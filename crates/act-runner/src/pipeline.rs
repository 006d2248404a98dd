// Operation pipeline: deferred, cancellable units of work and the combinators
// used to assemble container lifecycles and step stages from them.

use anyhow::Result;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;

type OperationFn = dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// A deferred unit of work. Nothing happens until [`Operation::run`] is called,
/// and the same operation may be run more than once.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<OperationFn>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Operation")
    }
}

impl Operation {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |cancel| f(cancel).boxed()),
        }
    }

    /// An operation that does nothing and succeeds.
    pub fn noop() -> Self {
        Self::new(|_| async { Ok(()) })
    }

    /// An operation that always fails with the error produced by `make_err`.
    pub fn fail<E>(make_err: E) -> Self
    where
        E: Fn() -> anyhow::Error + Send + Sync + 'static,
    {
        let make_err = Arc::new(make_err);
        Self::new(move |_| {
            let make_err = make_err.clone();
            async move { Err(make_err()) }
        })
    }

    /// Invoke the operation with the given cancellation handle.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        (self.inner)(cancel).await
    }

    /// Run `self`, then `next` if `self` succeeded.
    pub fn then(self, next: Operation) -> Operation {
        sequence([Some(self), Some(next)])
    }

    /// Run `self` only when `flag` is true.
    pub fn if_bool(self, flag: bool) -> Operation {
        guard(self, flag)
    }

    /// Run `self` and then `cleanup` regardless of the outcome. The first error wins.
    pub fn finally(self, cleanup: Operation) -> Operation {
        Operation::new(move |cancel: CancellationToken| {
            let op = self.clone();
            let cleanup = cleanup.clone();
            async move {
                let result = op.run(cancel.clone()).await;
                let cleanup_result = cleanup.run(cancel).await;
                result.and(cleanup_result)
            }
        })
    }

    /// Swallow any error of `self`, logging it at warn level.
    pub fn log_errors(self, what: &'static str) -> Operation {
        Operation::new(move |cancel| {
            let op = self.clone();
            async move {
                if let Err(e) = op.run(cancel).await {
                    tracing::warn!(target: "pipeline", "{}: {:#}", what, e);
                }
                Ok(())
            }
        })
    }
}

impl From<Option<Operation>> for Operation {
    fn from(op: Option<Operation>) -> Self {
        op.unwrap_or_else(Operation::noop)
    }
}

/// Run operations in order, stopping at the first error. `None` entries are no-ops.
/// A cancelled handle stops the sequence before the next operation starts.
pub fn sequence(ops: impl IntoIterator<Item = Option<Operation>>) -> Operation {
    let ops: Arc<Vec<Operation>> = Arc::new(ops.into_iter().flatten().collect());
    Operation::new(move |cancel: CancellationToken| {
        let ops = ops.clone();
        async move {
            for op in ops.iter() {
                if cancel.is_cancelled() {
                    return Err(RunnerError::Cancelled.into());
                }
                op.run(cancel.clone()).await?;
            }
            Ok(())
        }
    })
}

/// Run up to `max_concurrency` operations at once and wait for all of them.
///
/// Returns the first error observed; later errors are dropped. A limit below
/// one is treated as one.
pub fn parallel(max_concurrency: usize, ops: Vec<Operation>) -> Operation {
    let limit = max_concurrency.max(1);
    let ops = Arc::new(ops);
    Operation::new(move |cancel: CancellationToken| {
        let ops = ops.clone();
        async move {
            let results: Vec<Result<()>> = futures::stream::iter(ops.iter().cloned())
                .map(|op| {
                    let cancel = cancel.clone();
                    async move { op.run(cancel).await }
                })
                .buffer_unordered(limit)
                .collect()
                .await;
            results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
        }
    })
}

/// Evaluate `predicate` when the operation runs, then dispatch to `then_op` or `else_op`.
pub fn conditional<P>(predicate: P, then_op: Operation, else_op: Option<Operation>) -> Operation
where
    P: Fn() -> bool + Send + Sync + 'static,
{
    let else_op = Operation::from(else_op);
    Operation::new(move |cancel| {
        let chosen = if predicate() { then_op.clone() } else { else_op.clone() };
        async move { chosen.run(cancel).await }
    })
}

/// Run `op` only when `flag` is true.
pub fn guard(op: Operation, flag: bool) -> Operation {
    if flag {
        op
    } else {
        Operation::noop()
    }
}
