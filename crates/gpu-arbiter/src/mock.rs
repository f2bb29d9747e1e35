//! Test adapters implementing the collaborator traits
//!
//! In-memory stand-ins for the unit lifecycle client, GPU telemetry and the wall
//! clock, shared by unit tests and the integration tests.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Local;
use chrono::NaiveDate;

use crate::arbiter::Clock;
use crate::telemetry::GpuProcessRecord;
use crate::telemetry::GpuTelemetry;
use crate::unit::UnitLifecycle;

/// Lifecycle command observed by [`MockUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitCommand {
    Start,
    Stop,
}

#[derive(Default)]
struct MockUnitInner {
    running: bool,
    commands: Vec<UnitCommand>,
    start_fails: bool,
    stop_fails: bool,
    job: Option<(Arc<MockTelemetry>, GpuProcessRecord)>,
}

/// In-memory managed unit. Commands are only recorded when they would actually
/// be issued, i.e. when the unit is not already in the requested state.
#[derive(Default)]
pub struct MockUnit {
    inner: Mutex<MockUnitInner>,
}

impl MockUnit {
    pub fn new(running: bool) -> Self {
        Self {
            inner: Mutex::new(MockUnitInner {
                running,
                ..Default::default()
            }),
        }
    }

    /// Mirror the unit's background job on `telemetry`: the process is present
    /// while the unit runs and removed when it stops.
    pub fn with_job(self, telemetry: Arc<MockTelemetry>, job: GpuProcessRecord) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.running {
                telemetry.add_process(job.clone());
            }
            inner.job = Some((telemetry, job));
        }
        self
    }

    pub fn set_running(&self, running: bool) {
        self.inner.lock().unwrap().running = running;
    }

    pub fn fail_start(&self, fails: bool) {
        self.inner.lock().unwrap().start_fails = fails;
    }

    pub fn fail_stop(&self, fails: bool) {
        self.inner.lock().unwrap().stop_fails = fails;
    }

    pub fn commands(&self) -> Vec<UnitCommand> {
        self.inner.lock().unwrap().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.inner.lock().unwrap().commands.clear();
    }
}

#[async_trait]
impl UnitLifecycle for MockUnit {
    async fn is_running(&self, _id: &str) -> bool {
        self.inner.lock().unwrap().running
    }

    async fn start(&self, _id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.running {
            return true;
        }
        inner.commands.push(UnitCommand::Start);
        if inner.start_fails {
            return false;
        }
        inner.running = true;
        if let Some((telemetry, job)) = &inner.job {
            telemetry.add_process(job.clone());
        }
        true
    }

    async fn stop(&self, _id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.running {
            return true;
        }
        inner.commands.push(UnitCommand::Stop);
        if inner.stop_fails {
            return false;
        }
        inner.running = false;
        if let Some((telemetry, job)) = &inner.job {
            telemetry.remove_pid(job.pid);
        }
        true
    }
}

/// In-memory GPU process list.
#[derive(Default)]
pub struct MockTelemetry {
    processes: Mutex<Vec<GpuProcessRecord>>,
    polls: Mutex<usize>,
}

impl MockTelemetry {
    pub fn new(processes: Vec<GpuProcessRecord>) -> Self {
        Self {
            processes: Mutex::new(processes),
            polls: Mutex::new(0),
        }
    }

    pub fn set_processes(&self, processes: Vec<GpuProcessRecord>) {
        *self.processes.lock().unwrap() = processes;
    }

    pub fn add_process(&self, process: GpuProcessRecord) {
        self.processes.lock().unwrap().push(process);
    }

    pub fn remove_pid(&self, pid: u32) {
        self.processes.lock().unwrap().retain(|p| p.pid != pid);
    }

    pub fn polls(&self) -> usize {
        *self.polls.lock().unwrap()
    }
}

#[async_trait]
impl GpuTelemetry for MockTelemetry {
    async fn list_processes(&self) -> Vec<GpuProcessRecord> {
        *self.polls.lock().unwrap() += 1;
        self.processes.lock().unwrap().clone()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// A fixed summer day at the given local time of day.
    pub fn at_time_of_day(hour: u32, minute: u32) -> Self {
        Self::new(local_time(hour, minute))
    }

    pub fn set(&self, now: DateTime<Local>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).expect("duration in range");
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap()
    }
}

/// Local timestamp on a fixed date without DST transitions at night.
pub fn local_time(hour: u32, minute: u32) -> DateTime<Local> {
    NaiveDate::from_ymd_opt(2024, 6, 15)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .and_then(|dt| dt.and_local_timezone(Local).earliest())
        .expect("valid local time")
}
