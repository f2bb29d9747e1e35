//! One-shot diagnostics of the managed unit and the GPU.

use std::fmt;

use crate::arbiter::GpuInspection;
use crate::classifier::ProcessClass;
use crate::classifier::ProcessPatterns;
use crate::telemetry::GpuTelemetry;
use crate::unit::CommandUnit;
use crate::unit::UnitLifecycle;

#[derive(Debug)]
pub struct ProbeReport {
    pub unit_id: String,
    pub backend: String,
    pub backend_available: bool,
    pub unit_running: bool,
    pub inspection: GpuInspection,
}

impl ProbeReport {
    pub async fn collect(
        unit: &CommandUnit,
        unit_id: &str,
        telemetry: &dyn GpuTelemetry,
        patterns: &ProcessPatterns,
    ) -> Self {
        let backend_available = unit.is_available().await;
        let unit_running = backend_available && unit.is_running(unit_id).await;
        let processes = telemetry.list_processes().await;

        Self {
            unit_id: unit_id.to_string(),
            backend: unit.backend().to_string(),
            backend_available,
            unit_running,
            inspection: GpuInspection::new(processes, patterns),
        }
    }

    /// Emit the report through tracing, as done before the daemon starts serving.
    pub fn log(&self) {
        if self.backend_available {
            tracing::info!("{} is available", self.backend);
        } else {
            tracing::warn!(
                "{} is not available, unit {} cannot be controlled",
                self.backend,
                self.unit_id
            );
        }

        if self.inspection.processes.is_empty() {
            tracing::info!("No GPU processes found");
        }
        for entry in &self.inspection.processes {
            tracing::info!(
                "GPU process: pid={} name={} memory={}MiB class={:?}",
                entry.process.pid,
                entry.process.name,
                entry.process.memory_label(),
                entry.class
            );
        }

        tracing::info!(
            unit = %self.unit_id,
            "Unit running: {}, GPU idle: {}",
            self.unit_running,
            self.inspection.idle
        );
    }
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let availability = if self.backend_available {
            "available"
        } else {
            "unavailable"
        };
        let state = if self.unit_running { "running" } else { "stopped" };
        writeln!(f, "backend:  {} ({availability})", self.backend)?;
        writeln!(f, "unit:     {} {state}", self.unit_id)?;
        writeln!(f, "gpu idle: {}", self.inspection.idle)?;
        writeln!(
            f,
            "background job on gpu: {}",
            self.inspection.background_job_active
        )?;
        writeln!(f, "processes:")?;
        if self.inspection.processes.is_empty() {
            writeln!(f, "  (none)")?;
        }
        for entry in &self.inspection.processes {
            let class = match entry.class {
                ProcessClass::BackgroundJob => "background-job",
                ProcessClass::KnownSystem => "known-system",
                ProcessClass::Other => "other",
            };
            writeln!(
                f,
                "  {:>8}  {:>8} MiB  {:<14}  {}",
                entry.process.pid,
                entry.process.memory_label(),
                class,
                entry.process.name
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::telemetry::GpuProcessRecord;

    fn report(processes: Vec<GpuProcessRecord>) -> ProbeReport {
        ProbeReport {
            unit_id: "120".to_string(),
            backend: "pct".to_string(),
            backend_available: true,
            unit_running: false,
            inspection: GpuInspection::new(processes, &ProcessPatterns::default()),
        }
    }

    #[test]
    fn renders_classified_processes() {
        let rendered = report(vec![
            GpuProcessRecord::new(900, "xmrig", 9000),
            GpuProcessRecord::new(1, "Xorg", 40),
        ])
        .to_string();

        let expected = "\
backend:  pct (available)
unit:     120 stopped
gpu idle: true
background job on gpu: true
processes:
       900      9000 MiB  background-job  xmrig
         1        40 MiB  known-system    Xorg
";
        assert_eq!(rendered.as_str(), expected);
    }

    #[test]
    fn renders_empty_process_list() {
        let rendered = report(Vec::new()).to_string();

        assert!(rendered.ends_with("processes:\n  (none)\n"));
        assert!(rendered.contains("gpu idle: true"));
    }
}
