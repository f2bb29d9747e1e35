use serde::Serialize;

use crate::telemetry::GpuProcessRecord;

/// Processes at or below this footprint never count as "using" the GPU.
pub const DEFAULT_IDLE_MEMORY_THRESHOLD_MIB: u64 = 100;

pub const DEFAULT_BACKGROUND_JOB_PATTERNS: &[&str] =
    &["t-rex", "trex", "miner", "xmrig", "lolminer", "nbminer"];

pub const DEFAULT_KNOWN_SYSTEM_PROCESSES: &[&str] = &["Xorg"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessClass {
    BackgroundJob,
    KnownSystem,
    Other,
}

/// Name patterns and thresholds used to decide whether the GPU is idle.
#[derive(Debug, Clone)]
pub struct ProcessPatterns {
    /// lowercased, matched case-insensitively
    background_job: Vec<String>,
    /// matched case-sensitively
    known_system: Vec<String>,
    idle_memory_threshold_mib: u64,
}

impl Default for ProcessPatterns {
    fn default() -> Self {
        Self::new(
            DEFAULT_BACKGROUND_JOB_PATTERNS,
            DEFAULT_KNOWN_SYSTEM_PROCESSES,
            DEFAULT_IDLE_MEMORY_THRESHOLD_MIB,
        )
    }
}

impl ProcessPatterns {
    /// Empty patterns are dropped, since they would match every name.
    pub fn new<B, K>(background_job: B, known_system: K, idle_memory_threshold_mib: u64) -> Self
    where
        B: IntoIterator,
        B::Item: AsRef<str>,
        K: IntoIterator,
        K::Item: AsRef<str>,
    {
        Self {
            background_job: background_job
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
            known_system: known_system
                .into_iter()
                .map(|p| p.as_ref().trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            idle_memory_threshold_mib,
        }
    }

    pub fn background_job_patterns(&self) -> &[String] {
        &self.background_job
    }

    pub fn idle_memory_threshold_mib(&self) -> u64 {
        self.idle_memory_threshold_mib
    }

    pub fn is_background_job(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.background_job.iter().any(|p| name.contains(p.as_str()))
    }

    pub fn is_known_system(&self, name: &str) -> bool {
        self.known_system.iter().any(|p| name.contains(p.as_str()))
    }

    pub fn classify(&self, name: &str) -> ProcessClass {
        if self.is_background_job(name) {
            ProcessClass::BackgroundJob
        } else if self.is_known_system(name) {
            ProcessClass::KnownSystem
        } else {
            ProcessClass::Other
        }
    }

    pub fn has_background_job(&self, processes: &[GpuProcessRecord]) -> bool {
        processes.iter().any(|p| self.is_background_job(&p.name))
    }

    /// Processes that keep the GPU from being considered idle.
    pub fn blocking_processes<'a>(
        &self,
        processes: &'a [GpuProcessRecord],
    ) -> Vec<&'a GpuProcessRecord> {
        processes
            .iter()
            .filter(|p| {
                self.classify(&p.name) == ProcessClass::Other
                    && p.memory_mib
                        .map_or(true, |mib| mib > self.idle_memory_threshold_mib)
            })
            .collect()
    }

    /// The GPU is idle when every process is a background job, a known system
    /// process, or small enough to ignore.
    pub fn is_gpu_idle(&self, processes: &[GpuProcessRecord]) -> bool {
        let blocking = self.blocking_processes(processes);
        if blocking.is_empty() {
            if self.has_background_job(processes) {
                tracing::debug!("GPU is running the background job (acceptable idle state)");
            } else {
                tracing::debug!("GPU is truly idle (no significant processes)");
            }
            true
        } else {
            let names: Vec<&str> = blocking.iter().map(|p| p.name.as_str()).collect();
            tracing::debug!("GPU is in use by other processes: {names:?}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn process(name: &str, memory_mib: u64) -> GpuProcessRecord {
        GpuProcessRecord::new(1, name, memory_mib)
    }

    #[test]
    fn empty_process_list_is_idle() {
        assert!(ProcessPatterns::default().is_gpu_idle(&[]));
    }

    #[test]
    fn known_system_process_is_idle() {
        assert!(ProcessPatterns::default().is_gpu_idle(&[process("Xorg", 50)]));
        assert!(ProcessPatterns::default().is_gpu_idle(&[process("/usr/lib/Xorg", 400)]));
    }

    #[test]
    fn large_unknown_process_is_not_idle() {
        assert!(!ProcessPatterns::default().is_gpu_idle(&[process("foo", 150)]));
    }

    #[test]
    fn small_unknown_process_is_idle() {
        let patterns = ProcessPatterns::default();
        assert!(patterns.is_gpu_idle(&[process("foo", 100)]));
        assert!(!patterns.is_gpu_idle(&[process("foo", 101)]));
    }

    #[test]
    fn unreported_memory_blocks_idleness() {
        let patterns = ProcessPatterns::default();

        assert!(!patterns.is_gpu_idle(&[GpuProcessRecord::with_unknown_memory(
            55,
            "ollama_llama_server"
        )]));
        assert!(patterns.is_gpu_idle(&[GpuProcessRecord::with_unknown_memory(1, "Xorg")]));
        assert!(patterns.is_gpu_idle(&[GpuProcessRecord::with_unknown_memory(900, "xmrig")]));
    }

    #[test]
    fn background_job_never_counts_against_idleness() {
        assert!(ProcessPatterns::default().is_gpu_idle(&[process("xmrig", 9000)]));
    }

    #[test]
    fn background_job_match_is_case_insensitive() {
        let patterns = ProcessPatterns::default();
        assert!(patterns.is_background_job("/opt/T-Rex/t-rex"));
        assert!(patterns.is_background_job("LolMiner"));
        assert!(!patterns.is_background_job("ollama"));
    }

    #[test]
    fn known_system_match_is_case_sensitive() {
        let patterns = ProcessPatterns::default();
        assert!(patterns.is_known_system("Xorg"));
        assert!(!patterns.is_known_system("xorg"));
    }

    #[test]
    fn classification_prefers_background_job() {
        let patterns = ProcessPatterns::new(["miner"], ["miner-daemon"], 100);
        assert_eq!(patterns.classify("miner-daemon"), ProcessClass::BackgroundJob);
        assert_eq!(patterns.classify("ollama"), ProcessClass::Other);
    }

    #[test]
    fn empty_patterns_are_ignored() {
        let patterns = ProcessPatterns::new(["", "  "], [""], 100);
        assert!(patterns.background_job_patterns().is_empty());
        assert_eq!(patterns.classify("anything"), ProcessClass::Other);
    }

    #[test]
    fn blocking_processes_lists_only_offenders() {
        let patterns = ProcessPatterns::default();
        let processes = vec![
            process("xmrig", 9000),
            process("Xorg", 300),
            process("ollama_llama_server", 6000),
            process("tiny", 20),
        ];

        let blocking = patterns.blocking_processes(&processes);

        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].name.as_str(), "ollama_llama_server");
        assert!(patterns.has_background_job(&processes));
    }
}
