//! Memory reconciliation between NVML and an optional alternate accounting
//! source.
//!
//! NVML and `nvidia-smi` can disagree slightly on used memory because they
//! count reserved memory differently. When the alternate source is present
//! its figures win, so the overlay matches what users see in `nvidia-smi`.
//! The alternate source is queried once per cycle for every device.

use crate::data::{DeviceSnapshot, MemoryReading};
use std::collections::HashMap;
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccountingError {
    #[error("failed to run {program}: {source}")]
    Io {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("unexpected memory output: {0:?}")]
    Parse(String),
}

/// Per-device used/total memory, keyed by device index.
pub type MemoryTable = HashMap<u32, MemoryReading>;

/// A source of per-device used/total memory other than NVML itself.
pub trait MemoryAccounting: Send {
    fn source_name(&self) -> &'static str;
    /// Reads every device the source knows about in one go.
    fn read_all(&self) -> Result<MemoryTable, AccountingError>;
}

pub struct MemoryReconciler {
    alternate: Option<Box<dyn MemoryAccounting>>,
}

impl MemoryReconciler {
    pub fn new(alternate: Option<Box<dyn MemoryAccounting>>) -> Self {
        if let Some(source) = &alternate {
            log::info!("Using {} for memory accounting", source.source_name());
        }
        Self { alternate }
    }

    /// Queries the alternate source, if any, for the cycle about to run.
    pub fn begin_cycle(&self) -> CycleMemory {
        let alternate = self.alternate.as_ref().and_then(|source| {
            source
                .read_all()
                .map_err(|e| {
                    log::debug!("{} memory unavailable ({e}), using NVML", source.source_name())
                })
                .ok()
        });
        CycleMemory { alternate }
    }
}

/// Alternate readings captured for one cycle.
#[derive(Debug, Default)]
pub struct CycleMemory {
    alternate: Option<MemoryTable>,
}

impl CycleMemory {
    /// Picks the alternate reading when the source reported this index, else
    /// the standard one.
    pub fn reconcile(&self, index: u32, standard: MemoryReading) -> MemoryReading {
        let chosen = match &self.alternate {
            Some(table) => table.get(&index).copied().unwrap_or_else(|| {
                log::debug!("GPU {index}: no alternate memory reading, using NVML");
                standard
            }),
            None => standard,
        };
        chosen.clamped()
    }

    pub fn apply(&self, snapshot: DeviceSnapshot) -> DeviceSnapshot {
        let standard = MemoryReading {
            used_mb: snapshot.memory_used_mb,
            total_mb: snapshot.memory_total_mb,
        };
        let memory = self.reconcile(snapshot.index, standard);
        DeviceSnapshot {
            memory_used_mb: memory.used_mb,
            memory_total_mb: memory.total_mb,
            ..snapshot
        }
    }
}

const NVIDIA_SMI: &str = "nvidia-smi";

/// Memory figures as printed by `nvidia-smi`.
pub struct NvidiaSmi;

impl NvidiaSmi {
    /// Returns the source only if `nvidia-smi` can be run on this host.
    pub fn detect() -> Option<Self> {
        match Command::new(NVIDIA_SMI).arg("-L").output() {
            Ok(output) if output.status.success() => Some(Self),
            Ok(output) => {
                log::info!("{NVIDIA_SMI} present but unusable ({})", output.status);
                None
            }
            Err(_) => {
                log::info!("{NVIDIA_SMI} not found, using NVML memory figures only");
                None
            }
        }
    }
}

impl MemoryAccounting for NvidiaSmi {
    fn source_name(&self) -> &'static str {
        NVIDIA_SMI
    }

    fn read_all(&self) -> Result<MemoryTable, AccountingError> {
        let output = Command::new(NVIDIA_SMI)
            .arg("--query-gpu=index,memory.used,memory.total")
            .arg("--format=csv,noheader,nounits")
            .output()
            .map_err(|source| AccountingError::Io {
                program: NVIDIA_SMI,
                source,
            })?;

        if !output.status.success() {
            return Err(AccountingError::Failed {
                program: NVIDIA_SMI,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_memory_table(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parses `index, used, total` (MiB) lines. Any malformed line rejects the
/// whole table.
pub fn parse_memory_table(text: &str) -> Result<MemoryTable, AccountingError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let mut next = || -> Result<u64, AccountingError> {
                fields
                    .next()
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(|| AccountingError::Parse(line.to_string()))
            };
            let index =
                u32::try_from(next()?).map_err(|_| AccountingError::Parse(line.to_string()))?;
            let used_mb = next()?;
            let total_mb = next()?;
            Ok((index, MemoryReading { used_mb, total_mb }))
        })
        .collect()
}
