use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ApiServer;
use crate::app::core::Application;
use crate::monitor::run_monitor;
use crate::monitor::supervise;
use crate::monitor::RestartPolicy;
use crate::proxy::ProxyServer;

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
        let monitor_task = self.spawn_monitor_task(app);
        self.tasks.push(monitor_task);

        let proxy_task = self.spawn_proxy_task(app);
        self.tasks.push(proxy_task);

        if let Some(listen_addr) = app.daemon_args().status_listen_addr.clone() {
            let api_server_task = self.spawn_api_server_task(app, listen_addr);
            self.tasks.push(api_server_task);
        }
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            #[cfg(unix)]
            {
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
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                        std::future::pending::<()>().await;
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.cancellation_token.cancel();
                self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, index, remaining) = result;
                drop(remaining);
                // a finished JoinHandle must not be polled again
                self.tasks.remove(index);
                self.cancellation_token.cancel();
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly, stopping the remaining tasks");
                self.wait_for_tasks_with_timeout(SHUTDOWN_TIMEOUT).await;
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

    fn spawn_monitor_task(&self, app: &Application) -> JoinHandle<()> {
        let arbiter = app.services().arbiter.clone();
        let interval = app.daemon_args().poll_interval();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            tracing::info!("Starting GPU monitor task, interval {interval:?}");
            let monitor_token = token.clone();
            supervise("GPU monitor", RestartPolicy::default(), token, move || {
                run_monitor(arbiter.clone(), interval, monitor_token.clone())
            })
            .await;
            tracing::info!("GPU monitor task completed");
        })
    }

    fn spawn_proxy_task(&self, app: &Application) -> JoinHandle<()> {
        let gate = app.services().gate.clone();
        let listen_addr = app.daemon_args().listen_addr.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let proxy = ProxyServer::new(gate, listen_addr);
            if let Err(e) = proxy.run(token).await {
                tracing::error!("Proxy server failed: {e:?}");
            } else {
                tracing::info!("Proxy server completed");
            }
        })
    }

    fn spawn_api_server_task(&self, app: &Application, listen_addr: String) -> JoinHandle<()> {
        let arbiter = app.services().arbiter.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let api_server = ApiServer::new(arbiter, listen_addr);
            if let Err(e) = api_server.run(token).await {
                tracing::error!("Status API server failed: {e:?}");
            } else {
                tracing::info!("Status API server completed");
            }
        })
    }
}
