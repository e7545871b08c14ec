use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Host capability to read a process's resident memory.
pub trait ResidentMemory {
    fn resident_bytes(&mut self) -> Option<u64>;
}

/// Reads the current process through `sysinfo`.
pub struct SysinfoMemory {
    system: System,
    pid: Pid,
}

impl SysinfoMemory {
    pub fn detect() -> Option<Self> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            log::warn!("Process introspection is not supported on this platform");
            return None;
        }
        match sysinfo::get_current_pid() {
            Ok(pid) => Some(Self {
                system: System::new(),
                pid,
            }),
            Err(e) => {
                log::warn!("Cannot resolve own pid: {e}");
                None
            }
        }
    }
}

impl ResidentMemory for SysinfoMemory {
    fn resident_bytes(&mut self) -> Option<u64> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system.process(self.pid).map(|p| p.memory())
    }
}

/// Reports this process's resident memory in MB, or 0 when unknown.
pub struct SelfMemoryReporter {
    source: Option<Box<dyn ResidentMemory>>,
}

impl SelfMemoryReporter {
    pub fn new(source: Option<Box<dyn ResidentMemory>>) -> Self {
        Self { source }
    }

    pub fn detect() -> Self {
        Self::new(SysinfoMemory::detect().map(|p| Box::new(p) as Box<dyn ResidentMemory>))
    }

    pub fn is_available(&self) -> bool {
        self.source.is_some()
    }

    pub fn resident_mb(&mut self) -> f64 {
        self.source
            .as_mut()
            .and_then(|source| source.resident_bytes())
            .map_or(0.0, |bytes| bytes as f64 / BYTES_PER_MB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<u64>);

    impl ResidentMemory for Fixed {
        fn resident_bytes(&mut self) -> Option<u64> {
            self.0
        }
    }

    #[test]
    fn absent_capability_reports_zero() {
        let mut reporter = SelfMemoryReporter::new(None);
        assert!(!reporter.is_available());
        assert_eq!(reporter.resident_mb(), 0.0);
    }

    #[test]
    fn failed_read_reports_zero() {
        let mut reporter = SelfMemoryReporter::new(Some(Box::new(Fixed(None))));
        assert_eq!(reporter.resident_mb(), 0.0);
    }

    #[test]
    fn converts_bytes_to_mb() {
        let mut reporter = SelfMemoryReporter::new(Some(Box::new(Fixed(Some(48 * 1024 * 1024)))));
        assert_eq!(reporter.resident_mb(), 48.0);
    }

    #[test]
    fn sysinfo_reports_this_process() {
        let mut reporter = SelfMemoryReporter::detect();
        if reporter.is_available() {
            assert!(reporter.resident_mb() > 0.0);
        }
    }
}
