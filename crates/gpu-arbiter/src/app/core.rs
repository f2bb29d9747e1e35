use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;

/// Application core structure with explicit dependencies
pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, daemon_args: DaemonArgs) -> Self {
        Self {
            services,
            daemon_args,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Run application, start all tasks and wait for completion
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Starting all application tasks...");

        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(self);

        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("Error during task execution: {}", e);
            return Err(e);
        }

        tracing::info!("Application run completed");
        Ok(())
    }

    /// Log the final arbiter state. The managed unit is left as it is.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down application...");

        let state = self.services.arbiter.snapshot().await;
        tracing::info!(
            unit = %self.services.arbiter.config().unit_id,
            "Final state: unit running {}, inference active {}",
            state.unit_running,
            state.inference_active
        );

        tracing::info!("Application shutdown completed");
    }
}
