use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::metrics;
use crate::platform::k8s::pod_cache::PodWatcher;
use crate::platform::k8s::PodEvent;

const POD_EVENT_CHANNEL_CAPACITY: usize = 256;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) {
        let (pod_event_sender, pod_event_receiver) =
            mpsc::channel::<PodEvent>(POD_EVENT_CHANNEL_CAPACITY);

        let pod_watcher_task = self.spawn_pod_watcher_task(app, pod_event_sender);
        self.tasks.push(pod_watcher_task);

        let event_processor_task = self.spawn_event_processor_task(app, pod_event_receiver);
        self.tasks.push(event_processor_task);

        let manager_task = self.spawn_manager_task(app);
        self.tasks.push(manager_task);

        if app.daemon_args().enable_metrics {
            let metrics_task = self.spawn_metrics_task(app);
            self.tasks.push(metrics_task);
        }
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            })
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, _index, _remaining) = result;
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly");
            }
        }

        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_pod_watcher_task(
        &self,
        app: &Application,
        pod_event_sender: mpsc::Sender<PodEvent>,
    ) -> JoinHandle<()> {
        let pod_watcher = PodWatcher::new(
            app.services().kube_client.clone(),
            app.daemon_args().node_name.clone(),
            app.services().pod_cache.clone(),
            pod_event_sender,
        );
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting Kubernetes pod watcher task");
            if let Err(e) = pod_watcher.run(token).await {
                tracing::error!("Kubernetes pod watcher failed: {e:?}");
            } else {
                tracing::info!("Kubernetes pod watcher completed");
            }
        })
    }

    fn spawn_event_processor_task(
        &self,
        app: &Application,
        pod_event_receiver: mpsc::Receiver<PodEvent>,
    ) -> JoinHandle<()> {
        let cpu_manager = app.services().cpu_manager.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting pod event processor task");
            cpu_manager.process_events(pod_event_receiver, token).await;
            tracing::info!("Pod event processor task completed");
        })
    }

    /// Runs the allocation worker and the reconcile loop once the pod cache
    /// has synced; before that every checkpointed container would look stale.
    fn spawn_manager_task(&self, app: &Application) -> JoinHandle<()> {
        let cpu_manager = app.services().cpu_manager.clone();
        let pod_cache = app.services().pod_cache.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Waiting for pod cache to sync");
            tokio::select! {
                _ = token.cancelled() => return,
                _ = pod_cache.wait_for_sync() => {}
            }

            tracing::info!(pods = pod_cache.len(), "Pod cache synced, starting CPU manager");
            tokio::join!(
                cpu_manager.run_worker(token.clone()),
                cpu_manager.run_reconcile_loop(token.clone()),
            );
            tracing::info!("CPU manager task completed");
        })
    }

    fn spawn_metrics_task(&self, app: &Application) -> JoinHandle<()> {
        let cli = app.daemon_args();
        let manager_metrics = app.services().metrics.clone();
        let node_name = cli.node_name.clone();
        let interval = Duration::from_secs(cli.metrics_interval_secs.max(1));
        let metrics_format = cli.metrics_format.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting metrics collection task");
            metrics::run_metrics(manager_metrics, node_name, interval, metrics_format, token).await;
            tracing::info!("Metrics collection task completed");
        })
    }
}
