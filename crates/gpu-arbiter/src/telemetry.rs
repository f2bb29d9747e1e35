//! GPU process telemetry.
//!
//! Every poll produces a fresh list of [`GpuProcessRecord`]s; nothing is cached
//! between polls. Failures are logged and reported as an empty list, which the
//! arbiter reads as "no other processes on the GPU".

use core::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::Nvml;
use serde::Serialize;
use tokio::process::Command;

const BYTES_PER_MIB: u64 = 1024 * 1024;
const PROCESS_NAME_MAX_LEN: usize = 64;
const NVIDIA_SMI: &str = "nvidia-smi";

/// A process currently holding GPU memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuProcessRecord {
    pub pid: u32,
    pub name: String,
    /// `None` when the driver does not report the process's usage.
    pub memory_mib: Option<u64>,
}

impl GpuProcessRecord {
    pub fn new(pid: u32, name: impl Into<String>, memory_mib: u64) -> Self {
        Self {
            pid,
            name: name.into(),
            memory_mib: Some(memory_mib),
        }
    }

    pub fn with_unknown_memory(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            memory_mib: None,
        }
    }

    /// Memory in MiB for display, `N/A` when unknown.
    pub fn memory_label(&self) -> String {
        self.memory_mib
            .map_or_else(|| "N/A".to_string(), |mib| mib.to_string())
    }
}

/// Errors raised while querying GPU telemetry.
#[derive(Debug, Display)]
pub enum TelemetryError {
    #[display("NVML error: {message}")]
    Nvml { message: String },
    #[display("Failed to run `{command}`: {message}")]
    Command { command: String, message: String },
}

impl Error for TelemetryError {}

/// Source of the current GPU process list.
#[async_trait]
pub trait GpuTelemetry: Send + Sync {
    /// List the compute processes on the GPU; empty on failure.
    async fn list_processes(&self) -> Vec<GpuProcessRecord>;
}

/// Which telemetry backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TelemetryKind {
    /// NVML through the driver library
    Nvml,
    /// `nvidia-smi --query-compute-apps`
    NvidiaSmi,
    /// NVML when it initialises, `nvidia-smi` otherwise
    Auto,
}

/// Create the telemetry backend selected by `kind`.
pub fn connect(kind: TelemetryKind) -> Result<Arc<dyn GpuTelemetry>, Report<TelemetryError>> {
    match kind {
        TelemetryKind::Nvml => Ok(Arc::new(NvmlTelemetry::init()?)),
        TelemetryKind::NvidiaSmi => Ok(Arc::new(NvidiaSmiTelemetry)),
        TelemetryKind::Auto => match NvmlTelemetry::init() {
            Ok(nvml) => Ok(Arc::new(nvml)),
            Err(e) => {
                tracing::warn!("NVML unavailable, falling back to {NVIDIA_SMI}: {e:?}");
                Ok(Arc::new(NvidiaSmiTelemetry))
            }
        },
    }
}

/// Telemetry read from NVML.
pub struct NvmlTelemetry {
    nvml: Nvml,
}

impl NvmlTelemetry {
    pub fn init() -> Result<Self, Report<TelemetryError>> {
        let nvml = match Nvml::init() {
            Ok(nvml) => {
                tracing::info!("NVML initialized successfully");
                nvml
            }
            Err(_) => {
                tracing::warn!("Standard NVML init failed, trying with explicit library path");
                let nvml = Nvml::builder()
                    .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                    .init()
                    .change_context(TelemetryError::Nvml {
                        message: "failed to initialize NVML".into(),
                    })?;
                tracing::info!("NVML initialized with explicit library path");
                nvml
            }
        };
        Ok(Self { nvml })
    }

    fn query(&self) -> Result<Vec<GpuProcessRecord>, Report<TelemetryError>> {
        let nvml_error = |message: &str| TelemetryError::Nvml {
            message: message.to_string(),
        };

        let mut processes = Vec::new();
        let device_count = self
            .nvml
            .device_count()
            .change_context_lazy(|| nvml_error("failed to count devices"))?;

        for index in 0..device_count {
            let device = self
                .nvml
                .device_by_index(index)
                .change_context_lazy(|| nvml_error("failed to open device"))
                .attach_printable_lazy(|| format!("device index {index}"))?;

            let running = device
                .running_compute_processes()
                .change_context_lazy(|| nvml_error("failed to list compute processes"))
                .attach_printable_lazy(|| format!("device index {index}"))?;

            for info in running {
                let name = self
                    .nvml
                    .sys_process_name(info.pid, PROCESS_NAME_MAX_LEN)
                    .unwrap_or_else(|_| "unknown".to_string());
                processes.push(match info.used_gpu_memory {
                    UsedGpuMemory::Used(bytes) => {
                        GpuProcessRecord::new(info.pid, name, bytes / BYTES_PER_MIB)
                    }
                    UsedGpuMemory::Unavailable => {
                        GpuProcessRecord::with_unknown_memory(info.pid, name)
                    }
                });
            }
        }

        Ok(processes)
    }
}

#[async_trait]
impl GpuTelemetry for NvmlTelemetry {
    async fn list_processes(&self) -> Vec<GpuProcessRecord> {
        match self.query() {
            Ok(processes) => processes,
            Err(e) => {
                tracing::error!("Error getting GPU processes: {e:?}");
                Vec::new()
            }
        }
    }
}

/// Telemetry read by shelling out to `nvidia-smi`.
pub struct NvidiaSmiTelemetry;

impl NvidiaSmiTelemetry {
    async fn query(&self) -> Result<Vec<GpuProcessRecord>, Report<TelemetryError>> {
        let command_error = |message: String| TelemetryError::Command {
            command: NVIDIA_SMI.to_string(),
            message,
        };

        let output = Command::new(NVIDIA_SMI)
            .args([
                "--query-compute-apps=pid,process_name,used_memory",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await
            .change_context_lazy(|| command_error("could not execute".into()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Report::new(command_error(format!(
                "exited with {}: {stderr}",
                output.status
            ))));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_compute_apps(&stdout))
    }
}

#[async_trait]
impl GpuTelemetry for NvidiaSmiTelemetry {
    async fn list_processes(&self) -> Vec<GpuProcessRecord> {
        match self.query().await {
            Ok(processes) => processes,
            Err(e) => {
                tracing::error!("Error getting GPU processes: {e:?}");
                Vec::new()
            }
        }
    }
}

/// Parse `pid, process_name, used_memory` rows.
///
/// Rows without a numeric pid are skipped. A non-numeric memory column such as
/// `[N/A]` keeps the row with unknown memory.
pub fn parse_compute_apps(raw: &str) -> Vec<GpuProcessRecord> {
    let mut processes = Vec::new();
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let columns: Vec<&str> = line.split(',').map(str::trim).collect();
        if columns.len() < 3 {
            tracing::debug!("skipping malformed {NVIDIA_SMI} row: '{line}'");
            continue;
        }

        let Ok(pid) = columns[0].parse::<u32>() else {
            tracing::debug!("skipping malformed {NVIDIA_SMI} row: '{line}'");
            continue;
        };
        // process names may themselves contain commas
        let name = columns[1..columns.len() - 1].join(",");

        match columns[columns.len() - 1].parse::<u64>() {
            Ok(memory_mib) => processes.push(GpuProcessRecord::new(pid, name, memory_mib)),
            Err(_) => {
                tracing::debug!("memory usage of pid {pid} is not reported: '{line}'");
                processes.push(GpuProcessRecord::with_unknown_memory(pid, name));
            }
        }
    }
    processes
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test]
    fn parses_compute_apps_rows() {
        let raw = "1234, /usr/bin/ollama, 5120\n4321, xmrig, 9000\n\n";

        let processes = parse_compute_apps(raw);

        assert_eq!(
            processes,
            vec![
                GpuProcessRecord::new(1234, "/usr/bin/ollama", 5120),
                GpuProcessRecord::new(4321, "xmrig", 9000),
            ]
        );
    }

    #[test]
    fn keeps_commas_inside_process_names() {
        let processes = parse_compute_apps("77, worker,gpu, 300");

        assert_eq!(processes, vec![GpuProcessRecord::new(77, "worker,gpu", 300)]);
    }

    #[test]
    fn keeps_rows_with_unreported_memory() {
        let raw = "55, ollama_llama_server, [N/A]\ngarbage\nabc, x, 10\n11, python3, 200";

        let processes = parse_compute_apps(raw);

        assert_eq!(
            processes,
            vec![
                GpuProcessRecord::with_unknown_memory(55, "ollama_llama_server"),
                GpuProcessRecord::new(11, "python3", 200),
            ]
        );
        assert_eq!(processes[0].memory_label().as_str(), "N/A");
        assert_eq!(processes[1].memory_label().as_str(), "200");
    }

    #[test]
    fn empty_output_means_no_processes() {
        assert!(parse_compute_apps("").is_empty());
    }
}
