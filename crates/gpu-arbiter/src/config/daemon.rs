use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveTime;
use clap::Args;
use clap::Parser;
use error_stack::Report;
use utils::logging::LOG_PATH_ENV_VAR;

use crate::arbiter::ArbiterConfig;
use crate::arbiter::BlackoutWindow;
use crate::classifier::process::DEFAULT_BACKGROUND_JOB_PATTERNS;
use crate::classifier::process::DEFAULT_KNOWN_SYSTEM_PROCESSES;
use crate::classifier::ProcessPatterns;
use crate::config::parse_time_of_day;
use crate::config::ConfigError;
use crate::proxy::GateConfig;
use crate::telemetry::TelemetryKind;
use crate::unit::UnitBackend;

/// Which unit to manage and how.
#[derive(Args, Debug, Clone)]
pub struct UnitArgs {
    #[arg(
        long,
        env = "GPU_ARBITER_UNIT_ID",
        help = "Identifier of the managed unit hosting the background job, e.g. a container VMID"
    )]
    pub unit_id: String,

    #[arg(
        long,
        env = "GPU_ARBITER_UNIT_BACKEND",
        value_enum,
        default_value = "pct",
        help = "Tool used to start and stop the managed unit"
    )]
    pub unit_backend: UnitBackend,

    #[arg(
        long,
        env = "GPU_ARBITER_UNIT_TRANSITION_TIMEOUT_SECS",
        default_value = "15",
        help = "Maximum time to wait for the unit to reach the requested state"
    )]
    pub unit_transition_timeout_secs: u64,
}

impl UnitArgs {
    pub fn transition_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_transition_timeout_secs)
    }
}

/// GPU telemetry source and process classification rules.
#[derive(Args, Debug, Clone)]
pub struct GpuArgs {
    #[arg(
        long,
        env = "GPU_ARBITER_TELEMETRY",
        value_enum,
        default_value = "auto",
        help = "GPU process telemetry source"
    )]
    pub telemetry: TelemetryKind,

    #[arg(
        long,
        env = "GPU_ARBITER_BACKGROUND_PATTERNS",
        value_delimiter = ',',
        default_values = DEFAULT_BACKGROUND_JOB_PATTERNS.iter().copied(),
        help = "Case-insensitive process name fragments identifying the background job"
    )]
    pub background_patterns: Vec<String>,

    #[arg(
        long,
        env = "GPU_ARBITER_KNOWN_SYSTEM_PROCESSES",
        value_delimiter = ',',
        default_values = DEFAULT_KNOWN_SYSTEM_PROCESSES.iter().copied(),
        help = "Case-sensitive process name fragments that never block the GPU"
    )]
    pub known_system_processes: Vec<String>,

    #[arg(
        long,
        env = "GPU_ARBITER_IDLE_MEMORY_THRESHOLD_MIB",
        default_value = "100",
        help = "Processes using at most this much GPU memory are ignored"
    )]
    pub idle_memory_threshold_mib: u64,
}

impl From<&GpuArgs> for ProcessPatterns {
    fn from(args: &GpuArgs) -> Self {
        ProcessPatterns::new(
            &args.background_patterns,
            &args.known_system_processes,
            args.idle_memory_threshold_mib,
        )
    }
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub unit: UnitArgs,

    #[command(flatten)]
    pub gpu: GpuArgs,

    #[arg(
        long,
        env = "OLLAMA_HOST",
        help = "Host of the inference service the proxy forwards to"
    )]
    pub upstream_host: String,

    #[arg(
        long,
        env = "GPU_ARBITER_UPSTREAM_PORT",
        default_value = "11434",
        help = "Port of the inference service"
    )]
    pub upstream_port: u16,

    #[arg(
        long,
        env = "GPU_ARBITER_LISTEN_ADDR",
        default_value = "0.0.0.0:11435",
        help = "Proxy listen address"
    )]
    pub listen_addr: String,

    #[arg(
        long,
        env = "GPU_ARBITER_STATUS_LISTEN_ADDR",
        help = "Listen address of the status API, disabled when unset"
    )]
    pub status_listen_addr: Option<String>,

    #[arg(
        long,
        env = "GPU_ARBITER_POLL_INTERVAL_SECS",
        default_value = "10",
        help = "Interval between reconcile passes"
    )]
    pub poll_interval_secs: u64,

    #[arg(
        long,
        env = "GPU_ARBITER_ACTIVITY_TIMEOUT_SECS",
        default_value = "120",
        help = "Quiet period after the last inference request before the background job may resume"
    )]
    pub activity_timeout_secs: u64,

    #[arg(
        long,
        env = "GPU_ARBITER_BLACKOUT_START",
        value_parser = parse_time_of_day,
        default_value = "02:15",
        help = "Local time of day at which the blackout window starts"
    )]
    pub blackout_start: NaiveTime,

    #[arg(
        long,
        env = "GPU_ARBITER_BLACKOUT_END",
        value_parser = parse_time_of_day,
        default_value = "03:30",
        help = "Local time of day at which the blackout window ends, must not be before the start"
    )]
    pub blackout_end: NaiveTime,

    #[arg(
        long,
        env = "GPU_ARBITER_DRAIN_TIMEOUT_SECS",
        default_value = "10",
        help = "Maximum time preemption waits for background job processes to leave the GPU"
    )]
    pub drain_timeout_secs: u64,

    #[arg(
        long,
        env = "GPU_ARBITER_READ_SETTLE_DELAY_MS",
        default_value = "2000",
        help = "Pause after preemption before forwarding GET/HEAD requests"
    )]
    pub read_settle_delay_ms: u64,

    #[arg(
        long,
        env = "GPU_ARBITER_WRITE_SETTLE_DELAY_MS",
        default_value = "3500",
        help = "Pause after preemption before forwarding POST requests"
    )]
    pub write_settle_delay_ms: u64,

    #[arg(
        long,
        env = "GPU_ARBITER_UPSTREAM_CONNECT_TIMEOUT_SECS",
        default_value = "10",
        help = "Connect timeout for upstream requests"
    )]
    pub upstream_connect_timeout_secs: u64,

    #[arg(
        long,
        env = LOG_PATH_ENV_VAR,
        value_hint = clap::ValueHint::FilePath,
        default_value = "/var/log/gpu_proxy.log",
        help = "Log file, rotated daily"
    )]
    pub log_file: PathBuf,
}

impl DaemonArgs {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn blackout(&self) -> BlackoutWindow {
        BlackoutWindow::new(self.blackout_start, self.blackout_end)
    }

    /// Reject settings the daemon cannot run with.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidValue`] for an empty unit id or upstream host, or a
    ///   zero poll interval
    pub fn validate(&self) -> Result<(), Report<ConfigError>> {
        if self.unit.unit_id.trim().is_empty() {
            return Err(Report::new(ConfigError::InvalidValue {
                name: "unit-id",
                reason: "must not be empty".to_string(),
            }));
        }
        if self.upstream_host.trim().is_empty() {
            return Err(Report::new(ConfigError::InvalidValue {
                name: "upstream-host",
                reason: "must not be empty".to_string(),
            }));
        }
        if self.poll_interval_secs == 0 {
            return Err(Report::new(ConfigError::InvalidValue {
                name: "poll-interval-secs",
                reason: "must be at least 1".to_string(),
            }));
        }
        Ok(())
    }

    /// Settings that are accepted but probably not what the operator meant.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.blackout().is_inverted() {
            warnings.push(format!(
                "Blackout window {} starts after it ends and will never match; \
                 windows spanning midnight are not supported",
                self.blackout()
            ));
        }

        let gate = GateConfig::from(self);
        let longest_settle = gate.read_settle_delay.max(gate.write_settle_delay);
        if Duration::from_secs(self.activity_timeout_secs) <= longest_settle {
            warnings.push(format!(
                "Activity timeout {}s does not exceed the settle delay {longest_settle:?}; \
                 the background unit may restart before a preempted request is forwarded",
                self.activity_timeout_secs
            ));
        }

        warnings
    }
}

impl TryFrom<&DaemonArgs> for ArbiterConfig {
    type Error = Report<ConfigError>;

    fn try_from(args: &DaemonArgs) -> Result<Self, Self::Error> {
        args.validate()?;
        Ok(Self {
            unit_id: args.unit.unit_id.trim().to_string(),
            activity_timeout: Duration::from_secs(args.activity_timeout_secs),
            blackout: args.blackout(),
            drain_timeout: Duration::from_secs(args.drain_timeout_secs),
        })
    }
}

impl From<&DaemonArgs> for GateConfig {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            read_settle_delay: Duration::from_millis(args.read_settle_delay_ms),
            write_settle_delay: Duration::from_millis(args.write_settle_delay_ms),
            connect_timeout: Duration::from_secs(args.upstream_connect_timeout_secs),
            ..GateConfig::new(args.upstream_host.trim(), args.upstream_port)
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub unit: UnitArgs,

    #[command(flatten)]
    pub gpu: GpuArgs,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::config::Cli;
    use crate::config::Commands;

    fn daemon_args(extra: &[&str]) -> DaemonArgs {
        let mut argv = vec![
            "gpu-arbiter",
            "daemon",
            "--unit-id",
            "120",
            "--upstream-host",
            "10.0.0.5",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).expect("arguments should parse").command {
            Commands::Daemon(args) => *args,
            Commands::Probe(_) => panic!("expected the daemon subcommand"),
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let args = daemon_args(&[]);

        assert_eq!(args.upstream_port, 11434);
        assert_eq!(args.listen_addr, "0.0.0.0:11435");
        assert_eq!(args.poll_interval(), Duration::from_secs(10));
        assert_eq!(args.activity_timeout_secs, 120);
        assert_eq!(args.blackout().to_string(), "02:15-03:30");
        assert_eq!(args.unit.unit_backend, UnitBackend::Pct);
        assert_eq!(args.unit.transition_timeout(), Duration::from_secs(15));
        assert_eq!(args.gpu.telemetry, TelemetryKind::Auto);
        assert_eq!(
            args.gpu.background_patterns,
            vec!["t-rex", "trex", "miner", "xmrig", "lolminer", "nbminer"]
        );
        assert_eq!(args.gpu.known_system_processes, vec!["Xorg"]);
        assert_eq!(args.log_file, PathBuf::from("/var/log/gpu_proxy.log"));
        assert_eq!(args.status_listen_addr, None);
        assert!(args.warnings().is_empty());
    }

    #[test]
    fn converts_into_runtime_configs() {
        let args = daemon_args(&[
            "--activity-timeout-secs",
            "300",
            "--blackout-start",
            "01:00",
            "--blackout-end",
            "01:45:30",
            "--read-settle-delay-ms",
            "0",
            "--background-patterns",
            "Folding,boinc",
            "--idle-memory-threshold-mib",
            "256",
        ]);

        let arbiter = ArbiterConfig::try_from(&args).expect("valid config");
        assert_eq!(arbiter.unit_id, "120");
        assert_eq!(arbiter.activity_timeout, Duration::from_secs(300));
        assert_eq!(arbiter.blackout.to_string(), "01:00-01:45");
        assert_eq!(arbiter.drain_timeout, Duration::from_secs(10));

        let gate = GateConfig::from(&args);
        assert_eq!(gate.upstream_base, "http://10.0.0.5:11434");
        assert_eq!(gate.read_settle_delay, Duration::ZERO);
        assert_eq!(gate.write_settle_delay, Duration::from_millis(3500));

        let patterns = ProcessPatterns::from(&args.gpu);
        assert_eq!(patterns.background_job_patterns(), &["folding", "boinc"]);
        assert!(!patterns.is_background_job("xmrig"));
        assert_eq!(patterns.idle_memory_threshold_mib(), 256);
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let args = daemon_args(&["--poll-interval-secs", "0"]);

        let report = ArbiterConfig::try_from(&args).expect_err("zero interval is invalid");
        assert!(report.to_string().contains("poll-interval-secs"));
    }

    #[test]
    fn rejects_blank_unit_id() {
        let mut args = daemon_args(&[]);
        args.unit.unit_id = "  ".to_string();

        assert!(args.validate().is_err());
    }

    #[test]
    fn rejects_malformed_blackout_time() {
        let result = Cli::try_parse_from([
            "gpu-arbiter",
            "daemon",
            "--unit-id",
            "120",
            "--upstream-host",
            "10.0.0.5",
            "--blackout-start",
            "25:00",
        ]);

        assert!(result.is_err());
    }

    #[test]
    fn warns_about_window_spanning_midnight() {
        let args = daemon_args(&["--blackout-start", "23:00", "--blackout-end", "01:00"]);

        let warnings = args.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("never match"));
    }

    #[test]
    fn warns_when_activity_timeout_is_shorter_than_settle_delay() {
        let args = daemon_args(&["--activity-timeout-secs", "3"]);

        let warnings = args.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("settle delay"));
    }

    #[test]
    fn probe_accepts_unit_and_gpu_flags() {
        let cli = Cli::try_parse_from([
            "gpu-arbiter",
            "probe",
            "--unit-id",
            "ollama-miner.service",
            "--unit-backend",
            "systemd",
            "--telemetry",
            "nvidia-smi",
        ])
        .expect("arguments should parse");

        let Commands::Probe(args) = cli.command else {
            panic!("expected the probe subcommand");
        };
        assert_eq!(args.unit.unit_backend, UnitBackend::Systemd);
        assert_eq!(args.gpu.telemetry, TelemetryKind::NvidiaSmi);
    }
}
