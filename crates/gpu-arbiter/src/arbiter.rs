//! Resource arbiter deciding whether the background unit may use the GPU.
//!
//! All reads and writes of [`ResourceState`], and every unit lifecycle command,
//! happen while holding the arbiter's single state lock. Two paths take it:
//! the periodic [`Arbiter::reconcile`] pass and the on-demand
//! [`Arbiter::force_preempt`] issued from the request path.

use std::fmt;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Local;
use chrono::NaiveTime;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::MutexGuard;
use tokio::time::sleep;

use crate::classifier::ProcessClass;
use crate::classifier::ProcessPatterns;
use crate::telemetry::GpuProcessRecord;
use crate::telemetry::GpuTelemetry;
use crate::unit::UnitLifecycle;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_POLL_STEP: Duration = Duration::from_secs(1);

/// Wall-clock source for blackout and activity decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Daily time range during which the background unit must not run.
///
/// Matching is a literal `start <= now <= end` on the local time of day, so a
/// window whose start is after its end never matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlackoutWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl BlackoutWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time_of_day: NaiveTime) -> bool {
        self.start <= time_of_day && time_of_day <= self.end
    }

    /// True when the window can never match (it would span midnight).
    pub fn is_inverted(&self) -> bool {
        self.start > self.end
    }
}

impl Default for BlackoutWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(2, 15, 0).expect("valid time of day"),
            end: NaiveTime::from_hms_opt(3, 30, 0).expect("valid time of day"),
        }
    }
}

impl fmt::Display for BlackoutWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    pub unit_id: String,
    pub activity_timeout: Duration,
    pub blackout: BlackoutWindow,
    /// How long preemption waits for background processes to leave the GPU.
    pub drain_timeout: Duration,
}

impl ArbiterConfig {
    pub fn new(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            blackout: BlackoutWindow::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// The arbiter's view of the world.
///
/// `unit_running` is a belief rather than a verified fact: preemption clears it
/// without re-querying the unit, and the next reconcile pass re-probes the unit
/// and corrects it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceState {
    pub unit_running: bool,
    pub inference_active: bool,
    pub last_activity_at: Option<DateTime<Local>>,
    pub operation_in_progress: bool,
}

impl ResourceState {
    fn inference_still_active(&self, now: DateTime<Local>, timeout: Duration) -> bool {
        if !self.inference_active {
            return false;
        }
        match self.last_activity_at {
            // a clock that moved backwards counts as still active
            Some(last) => (now - last).to_std().map_or(true, |elapsed| elapsed < timeout),
            None => false,
        }
    }
}

/// Which decision a reconcile pass took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Another start/stop sequence was already in progress.
    Skipped,
    /// Inside the blackout window.
    Blackout { stopped: bool },
    /// Inference is still warm; the unit is kept stopped.
    InferenceHold { stopped: bool },
    Started,
    StartFailed,
    /// A background job was found on the GPU without the unit running.
    Adopted,
    StoppedForOtherProcess,
    NoChange,
}

/// Result of a preemption request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptOutcome {
    /// Neither the unit nor a background job was active.
    AlreadyIdle,
    Preempted,
    /// Background job processes were still on the GPU after the drain wait.
    Lingering,
}

/// A GPU process together with its classification.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedProcess {
    #[serde(flatten)]
    pub process: GpuProcessRecord,
    pub class: ProcessClass,
}

/// Snapshot of the GPU as the arbiter sees it.
#[derive(Debug, Clone, Serialize)]
pub struct GpuInspection {
    pub processes: Vec<ClassifiedProcess>,
    pub idle: bool,
    pub background_job_active: bool,
}

impl GpuInspection {
    pub fn new(processes: Vec<GpuProcessRecord>, patterns: &ProcessPatterns) -> Self {
        let idle = patterns.is_gpu_idle(&processes);
        let background_job_active = patterns.has_background_job(&processes);
        Self {
            processes: processes
                .into_iter()
                .map(|process| ClassifiedProcess {
                    class: patterns.classify(&process.name),
                    process,
                })
                .collect(),
            idle,
            background_job_active,
        }
    }
}

/// Keeps `operation_in_progress` set for as long as the guard lives, including
/// when the sequence unwinds.
struct OperationScope<'a> {
    state: MutexGuard<'a, ResourceState>,
}

impl<'a> OperationScope<'a> {
    fn begin(mut state: MutexGuard<'a, ResourceState>) -> Self {
        state.operation_in_progress = true;
        Self { state }
    }
}

impl Deref for OperationScope<'_> {
    type Target = ResourceState;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl DerefMut for OperationScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}

impl Drop for OperationScope<'_> {
    fn drop(&mut self) {
        self.state.operation_in_progress = false;
    }
}

pub struct Arbiter {
    config: ArbiterConfig,
    patterns: ProcessPatterns,
    unit: Arc<dyn UnitLifecycle>,
    telemetry: Arc<dyn GpuTelemetry>,
    clock: Arc<dyn Clock>,
    state: Mutex<ResourceState>,
}

impl Arbiter {
    /// Create the arbiter, seeding `unit_running` from the live unit status.
    pub async fn create(
        config: ArbiterConfig,
        patterns: ProcessPatterns,
        unit: Arc<dyn UnitLifecycle>,
        telemetry: Arc<dyn GpuTelemetry>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let unit_running = unit.is_running(&config.unit_id).await;
        tracing::info!(unit = %config.unit_id, "Managed unit running: {unit_running}");

        Arc::new(Self {
            config,
            patterns,
            unit,
            telemetry,
            clock,
            state: Mutex::new(ResourceState {
                unit_running,
                ..Default::default()
            }),
        })
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn patterns(&self) -> &ProcessPatterns {
        &self.patterns
    }

    pub fn in_blackout(&self) -> bool {
        self.config.blackout.contains(self.clock.now().time())
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> ResourceState {
        self.state.lock().await.clone()
    }

    /// Classify what is currently on the GPU, without touching any state.
    pub async fn inspect_gpu(&self) -> GpuInspection {
        let processes = self.telemetry.list_processes().await;
        GpuInspection::new(processes, &self.patterns)
    }

    /// One pass of the monitor loop.
    ///
    /// Returns immediately with [`ReconcileAction::Skipped`] if another sequence
    /// is marked in progress; the next tick retries.
    pub async fn reconcile(&self) -> ReconcileAction {
        let state = self.state.lock().await;
        if state.operation_in_progress {
            tracing::debug!("Unit operation already in progress, skipping reconcile");
            return ReconcileAction::Skipped;
        }

        let mut scope = OperationScope::begin(state);
        self.reconcile_locked(&mut scope).await
    }

    async fn reconcile_locked(&self, state: &mut ResourceState) -> ReconcileAction {
        let unit_id = self.config.unit_id.as_str();
        let unit_running = self.unit.is_running(unit_id).await;
        let processes = self.telemetry.list_processes().await;
        let background_active = self.patterns.has_background_job(&processes);
        let now = self.clock.now();

        state.unit_running = unit_running;

        if self.config.blackout.contains(now.time()) {
            tracing::debug!("Within scheduled blackout window {}", self.config.blackout);
            if unit_running {
                tracing::info!(unit = %unit_id, "Stopping unit for the scheduled blackout window");
                self.unit.stop(unit_id).await;
                state.unit_running = false;
            }
            return ReconcileAction::Blackout {
                stopped: unit_running,
            };
        }

        if state.inference_still_active(now, self.config.activity_timeout) {
            if unit_running || background_active {
                tracing::info!(unit = %unit_id, "Inference still active, keeping unit stopped");
                if unit_running {
                    self.unit.stop(unit_id).await;
                }
                state.unit_running = false;
            }
            return ReconcileAction::InferenceHold {
                stopped: unit_running,
            };
        }

        if state.inference_active {
            state.inference_active = false;
            tracing::info!(
                "Inference activity timeout reached after {:?}",
                self.config.activity_timeout
            );
        }

        if self.patterns.is_gpu_idle(&processes) {
            if !unit_running && !background_active {
                tracing::info!(unit = %unit_id, "GPU idle, starting unit");
                if self.unit.start(unit_id).await {
                    state.unit_running = true;
                    ReconcileAction::Started
                } else {
                    ReconcileAction::StartFailed
                }
            } else if background_active && !unit_running {
                tracing::debug!("Background job active on GPU, updating state");
                state.unit_running = true;
                ReconcileAction::Adopted
            } else {
                ReconcileAction::NoChange
            }
        } else if unit_running {
            let names: Vec<&str> = self
                .patterns
                .blocking_processes(&processes)
                .iter()
                .map(|p| p.name.as_str())
                .collect();
            tracing::info!(
                unit = %unit_id,
                "GPU in use by other processes {names:?}, stopping unit"
            );
            self.unit.stop(unit_id).await;
            state.unit_running = false;
            ReconcileAction::StoppedForOtherProcess
        } else {
            ReconcileAction::NoChange
        }
    }

    /// Stop the background unit so an inference request can use the GPU.
    ///
    /// Not gated by `operation_in_progress`: it queues on the state lock instead
    /// of backing off. Marks inference active as of now and leaves
    /// `unit_running` false without re-verifying the unit.
    pub async fn force_preempt(&self) -> PreemptOutcome {
        let mut state = self.state.lock().await;
        let unit_id = self.config.unit_id.as_str();

        state.inference_active = true;
        state.last_activity_at = Some(self.clock.now());

        let unit_running = self.unit.is_running(unit_id).await;
        let background_active = self.background_job_active().await;

        let outcome = if unit_running || background_active {
            tracing::info!(unit = %unit_id, "Force stopping unit for inference request");
            if unit_running {
                self.unit.stop(unit_id).await;
            }
            if background_active && !self.drain_background_jobs().await {
                PreemptOutcome::Lingering
            } else {
                PreemptOutcome::Preempted
            }
        } else {
            tracing::debug!(unit = %unit_id, "Unit already stopped, nothing to preempt");
            PreemptOutcome::AlreadyIdle
        };

        state.unit_running = false;
        outcome
    }

    /// Stamp the end of an inference request.
    pub async fn record_activity(&self) {
        let now = self.clock.now();
        self.state.lock().await.last_activity_at = Some(now);
    }

    async fn background_job_active(&self) -> bool {
        let processes = self.telemetry.list_processes().await;
        self.patterns.has_background_job(&processes)
    }

    /// Wait for background job processes to leave the GPU.
    async fn drain_background_jobs(&self) -> bool {
        let mut waited = Duration::ZERO;
        while self.background_job_active().await && waited < self.config.drain_timeout {
            sleep(DRAIN_POLL_STEP).await;
            waited += DRAIN_POLL_STEP;
        }

        if self.background_job_active().await {
            tracing::warn!(
                "Background job processes still active {:?} after unit stop",
                self.config.drain_timeout
            );
            false
        } else {
            true
        }
    }
}
