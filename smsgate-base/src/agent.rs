//! Agent bootstrap and task supervision.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::{eyre, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::metrics::CoreMetrics;
use crate::settings::Settings;
use crate::trace::start_tracing;

/// Settings of an agent defined from configuration.
pub trait LoadableFromSettings: AsRef<Settings> + Sized {
    /// Create a new instance of these settings by reading the environment.
    fn load() -> Result<Self>;
}

/// A long-running agent process.
#[async_trait]
pub trait BaseAgent: Send + Sync + Debug {
    /// The agent's name.
    const AGENT_NAME: &'static str;

    /// The settings object for this agent.
    type Settings: LoadableFromSettings;

    /// Instantiate the agent from the standard settings object.
    async fn from_settings(settings: Self::Settings, metrics: Arc<CoreMetrics>) -> Result<Self>
    where
        Self: Sized;

    /// Start running this agent; resolves only on fatal error or shutdown.
    async fn run(self) -> Result<()>;
}

/// Call this from `main` to fully initialize and run the agent for its
/// entire lifecycle. Installs error reporting and tracing before anything
/// else touches the process.
pub async fn agent_main<A: BaseAgent>() -> Result<()> {
    color_eyre::install()?;

    let settings = A::Settings::load()?;
    start_tracing(&settings.as_ref().log_level)?;

    let metrics = Arc::new(CoreMetrics::new(A::AGENT_NAME)?);
    let agent = A::from_settings(settings, metrics).await?;

    // This await only ends if a critical error is propagated, which we do
    // want to crash on.
    agent.run().await
}

/// A named long-running gateway task: the HTTP listener, the dispatcher, the
/// sweeper, the signal watcher.
pub type AgentTask = (&'static str, JoinHandle<Result<()>>);

/// Wait on the gateway's tasks until every one has wound down.
///
/// A clean exit just retires that task — on shutdown the signal watcher goes
/// first and the listener, dispatcher and sweeper drain behind it in
/// whatever order they finish. The first failure or panic instead cancels
/// whatever is still running and becomes the agent's exit error: a gateway
/// with a dead dispatcher must not keep accepting messages it will never
/// send.
pub async fn supervise(mut tasks: Vec<AgentTask>) -> Result<()> {
    while !tasks.is_empty() {
        let (outcome, index, _) =
            futures_util::future::select_all(tasks.iter_mut().map(|(_, handle)| handle)).await;
        let (name, _) = tasks.remove(index);
        match outcome {
            Ok(Ok(())) => debug!(task = name, "Gateway task retired"),
            Ok(Err(err)) => {
                error!(task = name, error = %err, "Gateway task failed; stopping the agent");
                cancel_remaining(tasks).await;
                return Err(err.wrap_err(format!("{name} task failed")));
            }
            Err(join_err) => {
                error!(task = name, error = %join_err, "Gateway task panicked; stopping the agent");
                cancel_remaining(tasks).await;
                return Err(eyre!("{name} task panicked: {join_err}"));
            }
        }
    }
    Ok(())
}

async fn cancel_remaining(tasks: Vec<AgentTask>) {
    for (name, handle) in tasks {
        handle.abort();
        let outcome = handle.await;
        debug!(task = name, outcome = ?outcome, "Cancelled gateway task");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn clean_exits_retire_in_any_order() {
        let tasks: Vec<AgentTask> = vec![
            ("fast", tokio::spawn(async { Ok(()) })),
            (
                "slow",
                tokio::spawn(async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(())
                }),
            ),
        ];
        assert!(supervise(tasks).await.is_ok());
    }

    #[tokio::test]
    async fn first_failure_cancels_the_survivors() {
        let (keep_alive_tx, keep_alive_rx) = tokio::sync::oneshot::channel::<()>();
        let tasks: Vec<AgentTask> = vec![
            ("broken", tokio::spawn(async { Err(eyre!("connection lost")) })),
            (
                "survivor",
                tokio::spawn(async move {
                    // Never resolves on its own; supervision must cancel it.
                    let _ = keep_alive_rx.await;
                    Ok(())
                }),
            ),
        ];
        let err = supervise(tasks).await.unwrap_err();
        let rendered = format!("{err:#}");
        assert!(rendered.contains("broken task failed"));
        assert!(rendered.contains("connection lost"));
        drop(keep_alive_tx);
    }
}
