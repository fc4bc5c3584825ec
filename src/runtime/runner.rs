use crate::backfill::orchestrator::{FeedSelection, Orchestrator};
use crate::backfill::outcome::RunSummary;
use crate::remote::RemoteConnector;
use crate::runtime::config::BackfillConfig;
use crate::runtime::progress::ProgressStore;
use crate::runtime::protocol::ScanProcessor;
use crate::runtime::telemetry::spawn_metrics_reporter;
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Drives backfill runs and handles OS signals for graceful shutdowns.
pub struct Runner<S, P> {
    orchestrator: Orchestrator<S, P>,
    shutdown: CancellationToken,
}

impl<S, P> Runner<S, P>
where
    S: ProgressStore,
    P: ScanProcessor,
{
    /// Creates a new runner and wires a root [`CancellationToken`] through the
    /// orchestrator, the locator and the scanner.
    pub fn new(
        config: BackfillConfig,
        connector: Arc<dyn RemoteConnector>,
        store: S,
        processor: P,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let orchestrator =
            Orchestrator::with_cancellation_token(config, connector, store, processor, shutdown.clone());
        Self {
            orchestrator,
            shutdown,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn orchestrator(&self) -> &Orchestrator<S, P> {
        &self.orchestrator
    }

    pub fn orchestrator_mut(&mut self) -> &mut Orchestrator<S, P> {
        &mut self.orchestrator
    }

    pub fn into_parts(self) -> (S, P) {
        self.orchestrator.into_parts()
    }

    /// Runs `selection` to completion or until the shutdown token is cancelled.
    pub async fn run(&mut self, selection: FeedSelection) -> Result<RunSummary> {
        self.run_with_signal(selection, std::future::pending()).await
    }

    /// Runs `selection` until it finishes or a Ctrl-C (SIGINT) arrives.
    ///
    /// On Ctrl-C the running window finishes and is checkpointed, remaining
    /// feeds are reported as cancelled and the summary is still returned.
    pub async fn run_until_ctrl_c(&mut self, selection: FeedSelection) -> Result<RunSummary> {
        tracing::info!("runner started; Ctrl-C (SIGINT) stops after the current window");
        self.run_with_signal(selection, async {
            if let Err(err) = signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    async fn run_with_signal<F>(&mut self, selection: FeedSelection, stop: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let telemetry = self.orchestrator.telemetry();
        let reporter_shutdown = self.shutdown.child_token();
        let reporter = spawn_metrics_reporter(
            telemetry,
            reporter_shutdown.clone(),
            self.orchestrator.config().metrics_interval(),
        );

        let shutdown = self.shutdown.clone();
        let result = {
            let run = self.orchestrator.run(selection);
            tokio::pin!(run);

            tokio::select! {
                result = &mut run => result,
                _ = stop => {
                    tracing::info!("stop requested; finishing the current window");
                    shutdown.cancel();
                    run.await
                }
            }
        };

        reporter_shutdown.cancel();
        if let Err(err) = reporter.await {
            tracing::warn!(error = %err, "metrics reporter task failed");
        }

        if self.shutdown.is_cancelled() {
            self.reinitialize_shutdown_token();
        }
        result
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        self.orchestrator.replace_shutdown_root(self.shutdown.clone());
    }
}
