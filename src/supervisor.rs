//! Supervised concurrent operations.
//!
//! Every long-running loop of a role is created through a [`Supervisor`].
//! The first operation that fails with an error kind outside the suppress
//! list (or panics) cancels all the others and is returned from
//! [`Supervisor::run`], which takes the process down.

use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{FarmError, Result};

pub struct Supervisor {
    operations: JoinSet<(String, Result<()>)>,
    token: CancellationToken,
    suppress: HashSet<&'static str>,
}

impl Supervisor {
    /// A supervisor whose operations stop when `parent` is cancelled.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            operations: JoinSet::new(),
            token: parent.child_token(),
            suppress: HashSet::new(),
        }
    }

    /// Errors of this kind (see [`FarmError::kind`]) are logged and the
    /// failing operation is dropped without stopping the rest.
    pub fn suppress(mut self, kind: &'static str) -> Self {
        self.suppress.insert(kind);
        self
    }

    /// Token cancelled when the supervisor stops. Operations watch it at
    /// their suspension points.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn create<F>(&mut self, name: impl Into<String>, operation: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(operation = %name, "Operation created");
        self.operations.spawn(async move {
            let outcome = AssertUnwindSafe(operation).catch_unwind().await;
            let result = outcome.unwrap_or_else(|panic| {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                Err(FarmError::Internal(format!("panicked: {reason}")))
            });
            (name, result)
        });
    }

    /// Wait until the token is cancelled, every operation has finished, or
    /// one fails. Remaining operations are cancelled before returning.
    pub async fn run(mut self) -> Result<()> {
        let mut failure = None;
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => None,
                joined = self.operations.join_next() => joined,
            };
            let Some(joined) = next else { break };

            match joined {
                Ok((name, Ok(()))) => {
                    tracing::debug!(operation = %name, "Operation finished");
                }
                Ok((name, Err(e))) if self.suppress.contains(e.kind()) => {
                    tracing::warn!(operation = %name, error = %e, "Operation failed, suppressed");
                }
                Ok((name, Err(e))) => {
                    tracing::error!(operation = %name, error = %e, "Operation failed, stopping");
                    failure = Some(FarmError::Supervisor {
                        operation: name,
                        reason: e.to_string(),
                    });
                    break;
                }
                Err(e) => {
                    // Only reachable through an external abort.
                    tracing::warn!(error = %e, "Operation aborted");
                }
            }
        }

        self.token.cancel();
        self.operations.abort_all();
        while self.operations.join_next().await.is_some() {}

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. If the handlers cannot be installed the token is never
/// cancelled by a signal.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => {
                tracing::info!(signal = name, "Received signal, initiating graceful shutdown");
                trigger.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to install signal handlers"),
        }
    });

    token
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn completes_when_all_operations_finish() {
        let root = CancellationToken::new();
        let mut supervisor = Supervisor::new(&root);
        supervisor.create("a", async { Ok(()) });
        supervisor.create("b", async { Ok(()) });
        supervisor.run().await.unwrap();
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancellation_stops_operations() {
        let root = CancellationToken::new();
        let mut supervisor = Supervisor::new(&root);
        let token = supervisor.token();
        supervisor.create("forever", async move {
            token.cancelled().await;
            Ok(())
        });
        root.cancel();
        supervisor.run().await.unwrap();
    }

    #[tokio::test]
    async fn panics_are_fatal_and_named() {
        let root = CancellationToken::new();
        let mut supervisor = Supervisor::new(&root);
        supervisor.create("explodes", async {
            if true {
                panic!("boom");
            }
            Ok(())
        });
        match supervisor.run().await {
            Err(FarmError::Supervisor { operation, reason }) => {
                assert_eq!(operation, "explodes");
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn suppressed_kind_does_not_stop_siblings() {
        let root = CancellationToken::new();
        let mut supervisor = Supervisor::new(&root).suppress("timeout");
        let token = supervisor.token();
        supervisor.create("flaky", async { Err(FarmError::Timeout("dial".into())) });
        supervisor.create("steady", async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(!token.is_cancelled());
            Ok(())
        });
        supervisor.run().await.unwrap();
    }
}
