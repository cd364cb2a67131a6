use std::future::Future;

use anyhow::{anyhow, Result as AnyResult};
use tokio::{spawn, task::JoinHandle};
use tracing::error;

/// Like `assert!`, but returns `Err(error)` instead of panicking.
#[macro_export]
macro_rules! require {
    ($cond:expr, $error:expr) => {
        if !($cond) {
            return Err($error);
        }
    };
}

/// Spawn a task that aborts the process if the future resolves to an error.
/// Mirrors the fault-isolation policy of the block watcher: a per-chain task
/// that cannot make progress should take the whole process down so an
/// orchestrator can restart it, rather than limp along silently.
pub fn spawn_or_abort<F>(future: F) -> JoinHandle<()>
where
    F: Future<Output = AnyResult<()>> + Send + 'static,
{
    spawn(async move {
        if let Err(error) = future.await {
            error!(?error, "Fatal error in task, aborting");
            std::process::abort();
        }
    })
}

/// Flatten a `Result<Result<T, E>, JoinError>` into `AnyResult<T>`, collecting
/// panics from the spawned task as an error instead of propagating the panic.
pub trait AnyFlatten<T> {
    fn any_flatten(self) -> AnyResult<T>;
}

impl<T, E> AnyFlatten<T> for Result<Result<T, E>, tokio::task::JoinError>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn any_flatten(self) -> AnyResult<T> {
        match self {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(anyhow!(error)),
            Err(join_error) => Err(anyhow!(join_error)),
        }
    }
}
