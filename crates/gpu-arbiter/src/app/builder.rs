use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;

use crate::app::Application;
use crate::app::ApplicationServices;
use crate::arbiter::Arbiter;
use crate::arbiter::ArbiterConfig;
use crate::arbiter::SystemClock;
use crate::classifier::ProcessPatterns;
use crate::config::DaemonArgs;
use crate::probe::ProbeReport;
use crate::proxy::ForwardingGate;
use crate::proxy::GateConfig;
use crate::telemetry;
use crate::unit::CommandUnit;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Build complete application
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");

        let arbiter_config = ArbiterConfig::try_from(&self.daemon_args)
            .map_err(|e| anyhow!("Invalid configuration: {e:?}"))?;
        for warning in self.daemon_args.warnings() {
            tracing::warn!("{warning}");
        }
        let patterns = ProcessPatterns::from(&self.daemon_args.gpu);

        let unit = Arc::new(CommandUnit::new(
            self.daemon_args.unit.unit_backend,
            self.daemon_args.unit.transition_timeout(),
        ));
        let telemetry = telemetry::connect(self.daemon_args.gpu.telemetry)
            .map_err(|e| anyhow!("Failed to initialize GPU telemetry: {e:?}"))?;

        ProbeReport::collect(&unit, &arbiter_config.unit_id, telemetry.as_ref(), &patterns)
            .await
            .log();

        let arbiter = Arbiter::create(
            arbiter_config,
            patterns,
            unit,
            telemetry,
            Arc::new(SystemClock),
        )
        .await;

        let gate = ForwardingGate::new(arbiter.clone(), GateConfig::from(&self.daemon_args))
            .map_err(|e| anyhow!("Failed to create forwarding gate: {e:?}"))?;

        let services = ApplicationServices {
            arbiter,
            gate: Arc::new(gate),
        };

        Ok(Application::new(services, self.daemon_args))
    }
}
