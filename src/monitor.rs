use crate::data::{bytes_to_mb, DeviceSnapshot, MemoryReading, ProcessUsage};
use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::{nvml_sym, nvml_try, NvmlError};
use nvml_wrapper::{Device, Nvml};
use nvml_wrapper_sys::bindings::NvmlLib;
use std::os::raw::c_uint;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("NVML initialization failed: {0}")]
    NvmlInit(#[source] NvmlError),
    #[error("Device not found at index {0}: {1}")]
    DeviceNotFound(u32, #[source] NvmlError),
    #[error("NVML query failed: {0}")]
    Query(#[from] NvmlError),
    #[error("Sample cycle panicked: {0}")]
    CyclePanicked(String),
    #[error("Sampler thread exited before the session was ready")]
    InitAborted,
    #[error("Failed to spawn sampler thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Snapshot receiver has gone away")]
    SinkClosed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Utilization {
    pub compute: u32,
    pub memory_bandwidth: u32,
}

/// A session with the device management subsystem.
///
/// The session is owned by the sampler thread for its whole lifetime and is
/// never shared with the presentation side.
pub trait DeviceSession {
    fn device_count(&self) -> Result<u32, MonitorError>;
    fn device(&self, index: u32) -> Result<Box<dyn DeviceQuery + '_>, MonitorError>;
    /// Releases the session. Never fails; problems are only logged.
    fn shutdown(self)
    where
        Self: Sized;
}

/// Raw per-metric getters for one device. Each call may fail on its own.
pub trait DeviceQuery {
    fn name(&self) -> Result<String, MonitorError>;
    fn utilization(&self) -> Result<Utilization, MonitorError>;
    fn memory(&self) -> Result<MemoryReading, MonitorError>;
    fn temperature(&self) -> Result<u32, MonitorError>;
    fn power_usage_mw(&self) -> Result<u32, MonitorError>;
    fn power_limit_mw(&self) -> Result<u32, MonitorError>;
    fn fan_count(&self) -> Result<u32, MonitorError>;
    fn fan_speed(&self, fan: u32) -> Result<u32, MonitorError>;
    /// Single-value fan query for drivers without per-fan support.
    fn legacy_fan_speed(&self) -> Result<u32, MonitorError>;
    fn processes(&self) -> Result<Vec<ProcessUsage>, MonitorError>;
}

fn or_default<T: Default>(index: u32, metric: &str, result: Result<T, MonitorError>) -> T {
    result.unwrap_or_else(|e| {
        log::debug!("GPU {index}: {metric} unavailable: {e}");
        T::default()
    })
}

/// Reads every metric of one device independently. A failing metric leaves
/// its field at the zero/empty default and does not affect the others.
///
/// Memory here is the standard reading; reconciliation happens afterwards.
pub fn read_device(index: u32, device: &dyn DeviceQuery) -> DeviceSnapshot {
    let utilization = or_default(index, "utilization", device.utilization());
    let memory = or_default(index, "memory", device.memory()).clamped();
    let power_usage_mw = or_default(index, "power usage", device.power_usage_mw());
    let power_limit_mw = or_default(index, "power limit", device.power_limit_mw());

    DeviceSnapshot {
        index,
        name: or_default(index, "name", device.name()),
        utilization_compute: utilization.compute,
        utilization_memory_bandwidth: utilization.memory_bandwidth,
        memory_used_mb: memory.used_mb,
        memory_total_mb: memory.total_mb,
        temperature_c: or_default(index, "temperature", device.temperature()),
        power_usage_w: power_usage_mw as f64 / 1000.0,
        power_limit_w: power_limit_mw as f64 / 1000.0,
        fan_speeds: read_fan_speeds(index, device),
        processes: or_default(index, "processes", device.processes()),
    }
}

/// Per-fan speeds first, then the legacy single reading, then nothing.
pub fn read_fan_speeds(index: u32, device: &dyn DeviceQuery) -> Vec<u32> {
    match multi_fan_speeds(device) {
        Ok(speeds) => speeds,
        Err(e) => {
            log::debug!("GPU {index}: per-fan query failed ({e}), trying legacy fan query");
            match legacy_fan_speeds(device) {
                Ok(speeds) => speeds,
                Err(e) => {
                    log::debug!("GPU {index}: no fan data: {e}");
                    Vec::new()
                }
            }
        }
    }
}

fn multi_fan_speeds(device: &dyn DeviceQuery) -> Result<Vec<u32>, MonitorError> {
    let count = device.fan_count()?;
    (0..count).map(|fan| device.fan_speed(fan)).collect()
}

fn legacy_fan_speeds(device: &dyn DeviceQuery) -> Result<Vec<u32>, MonitorError> {
    Ok(vec![device.legacy_fan_speed()?])
}

/// Merges several process listings, keeping the first entry seen per pid.
/// Fails only when every listing failed.
pub fn merge_process_lists<E>(
    listings: impl IntoIterator<Item = Result<Vec<ProcessUsage>, E>>,
) -> Result<Vec<ProcessUsage>, E> {
    let mut merged: Vec<ProcessUsage> = Vec::new();
    let mut last_err = None;
    let mut any_ok = false;

    for listing in listings {
        match listing {
            Ok(procs) => {
                any_ok = true;
                for proc in procs {
                    if !merged.iter().any(|p| p.pid == proc.pid) {
                        merged.push(proc);
                    }
                }
            }
            Err(e) => last_err = Some(e),
        }
    }

    match last_err {
        Some(e) if !any_ok => Err(e),
        _ => Ok(merged),
    }
}

#[cfg(target_os = "windows")]
const NVML_LIB: &str = "nvml.dll";
#[cfg(not(target_os = "windows"))]
const NVML_LIB: &str = "libnvidia-ml.so.1";

pub struct NvmlSession {
    nvml: Nvml,
    // Second handle on the already loaded library, for entry points the
    // wrapper does not expose.
    raw: Option<NvmlLib>,
}

impl NvmlSession {
    pub fn initialize() -> Result<Self, MonitorError> {
        let nvml = Nvml::init().map_err(MonitorError::NvmlInit)?;
        let driver = nvml
            .sys_driver_version()
            .unwrap_or_else(|_| "N/A".to_string());
        log::info!("NVML session started, driver {driver}");
        Ok(Self {
            nvml,
            raw: load_raw_library(NVML_LIB),
        })
    }
}

fn load_raw_library(path: &str) -> Option<NvmlLib> {
    // SAFETY: the library is NVML itself, already loaded and initialized by
    // `Nvml::init`; loading only resolves symbols.
    match unsafe { NvmlLib::new(path) } {
        Ok(lib) => Some(lib),
        Err(e) => {
            log::debug!("Legacy NVML entry points unavailable: {e}");
            None
        }
    }
}

impl DeviceSession for NvmlSession {
    fn device_count(&self) -> Result<u32, MonitorError> {
        Ok(self.nvml.device_count()?)
    }

    fn device(&self, index: u32) -> Result<Box<dyn DeviceQuery + '_>, MonitorError> {
        let device = self
            .nvml
            .device_by_index(index)
            .map_err(|e| MonitorError::DeviceNotFound(index, e))?;
        Ok(Box::new(NvmlDevice {
            device,
            raw: self.raw.as_ref(),
        }))
    }

    fn shutdown(self) {
        match self.nvml.shutdown() {
            Ok(()) => log::info!("NVML session shut down"),
            Err(e) => log::warn!("NVML shutdown reported an error: {e}"),
        }
    }
}

struct NvmlDevice<'nvml> {
    device: Device<'nvml>,
    raw: Option<&'nvml NvmlLib>,
}

fn process_usage(proc: nvml_wrapper::struct_wrappers::device::ProcessInfo) -> ProcessUsage {
    let memory_used_mb = match proc.used_gpu_memory {
        UsedGpuMemory::Used(bytes) => bytes_to_mb(bytes),
        UsedGpuMemory::Unavailable => 0,
    };
    ProcessUsage {
        pid: proc.pid,
        memory_used_mb,
    }
}

impl DeviceQuery for NvmlDevice<'_> {
    fn name(&self) -> Result<String, MonitorError> {
        Ok(self.device.name()?)
    }

    fn utilization(&self) -> Result<Utilization, MonitorError> {
        let util = self.device.utilization_rates()?;
        Ok(Utilization {
            compute: util.gpu,
            memory_bandwidth: util.memory,
        })
    }

    fn memory(&self) -> Result<MemoryReading, MonitorError> {
        let mem = self.device.memory_info()?;
        Ok(MemoryReading::from_bytes(mem.used, mem.total))
    }

    fn temperature(&self) -> Result<u32, MonitorError> {
        Ok(self.device.temperature(TemperatureSensor::Gpu)?)
    }

    fn power_usage_mw(&self) -> Result<u32, MonitorError> {
        Ok(self.device.power_usage()?)
    }

    // Upper bound of the configurable limit, falling back to the enforced one.
    fn power_limit_mw(&self) -> Result<u32, MonitorError> {
        let limit = self
            .device
            .power_management_limit_constraints()
            .map(|c| c.max_limit)
            .or_else(|_| self.device.power_management_limit())?;
        Ok(limit)
    }

    fn fan_count(&self) -> Result<u32, MonitorError> {
        Ok(self.device.num_fans()?)
    }

    fn fan_speed(&self, fan: u32) -> Result<u32, MonitorError> {
        Ok(self.device.fan_speed(fan)?)
    }

    // nvmlDeviceGetFanSpeed, the pre-multi-fan call.
    fn legacy_fan_speed(&self) -> Result<u32, MonitorError> {
        let lib = self.raw.ok_or(NvmlError::FunctionNotFound)?;
        let sym = nvml_sym(lib.nvmlDeviceGetFanSpeed.as_ref())?;
        let mut speed: c_uint = 0;
        // SAFETY: the handle belongs to the live session and `speed` outlives
        // the call.
        unsafe { nvml_try(sym(self.device.handle(), &mut speed))? };
        Ok(speed)
    }

    fn processes(&self) -> Result<Vec<ProcessUsage>, MonitorError> {
        let listings = [
            self.device.running_compute_processes(),
            self.device.running_graphics_processes(),
        ]
        .into_iter()
        .map(|listing| {
            listing.map(|procs| procs.into_iter().map(process_usage).collect::<Vec<_>>())
        });
        Ok(merge_process_lists(listings)?)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn unsupported<T>() -> Result<T, MonitorError> {
        Err(MonitorError::Query(NvmlError::NotSupported))
    }

    /// A scripted device. `None` makes the corresponding query fail.
    #[derive(Clone, Debug, Default)]
    pub struct FakeDevice {
        pub name: Option<String>,
        pub utilization: Option<Utilization>,
        pub memory: Option<MemoryReading>,
        pub temperature: Option<u32>,
        pub power_usage_mw: Option<u32>,
        pub power_limit_mw: Option<u32>,
        pub fan_count: Option<u32>,
        pub fan_speeds: Option<Vec<u32>>,
        pub legacy_fan: Option<u32>,
        pub processes: Option<Vec<ProcessUsage>>,
    }

    impl FakeDevice {
        pub fn healthy(name: &str) -> Self {
            Self {
                name: Some(name.to_string()),
                utilization: Some(Utilization {
                    compute: 42,
                    memory_bandwidth: 17,
                }),
                memory: Some(MemoryReading {
                    used_mb: 2048,
                    total_mb: 8192,
                }),
                temperature: Some(55),
                power_usage_mw: Some(120_500),
                power_limit_mw: Some(250_000),
                fan_count: Some(2),
                fan_speeds: Some(vec![40, 42]),
                legacy_fan: Some(41),
                processes: Some(vec![ProcessUsage {
                    pid: 1234,
                    memory_used_mb: 512,
                }]),
            }
        }
    }

    impl DeviceQuery for FakeDevice {
        fn name(&self) -> Result<String, MonitorError> {
            self.name.clone().map_or_else(unsupported, Ok)
        }
        fn utilization(&self) -> Result<Utilization, MonitorError> {
            self.utilization.map_or_else(unsupported, Ok)
        }
        fn memory(&self) -> Result<MemoryReading, MonitorError> {
            self.memory.map_or_else(unsupported, Ok)
        }
        fn temperature(&self) -> Result<u32, MonitorError> {
            self.temperature.map_or_else(unsupported, Ok)
        }
        fn power_usage_mw(&self) -> Result<u32, MonitorError> {
            self.power_usage_mw.map_or_else(unsupported, Ok)
        }
        fn power_limit_mw(&self) -> Result<u32, MonitorError> {
            self.power_limit_mw.map_or_else(unsupported, Ok)
        }
        fn fan_count(&self) -> Result<u32, MonitorError> {
            self.fan_count.map_or_else(unsupported, Ok)
        }
        fn fan_speed(&self, fan: u32) -> Result<u32, MonitorError> {
            self.fan_speeds
                .as_ref()
                .and_then(|speeds| speeds.get(fan as usize).copied())
                .map_or_else(unsupported, Ok)
        }
        fn legacy_fan_speed(&self) -> Result<u32, MonitorError> {
            self.legacy_fan.map_or_else(unsupported, Ok)
        }
        fn processes(&self) -> Result<Vec<ProcessUsage>, MonitorError> {
            self.processes.clone().map_or_else(unsupported, Ok)
        }
    }

    #[derive(Debug, Default)]
    pub struct FakeState {
        pub devices: Vec<FakeDevice>,
        pub fail_count: bool,
        pub panic_on_count: bool,
        /// Indices whose handle lookup fails as if the GPU fell off the bus.
        pub lost: Vec<u32>,
        pub count_calls: usize,
        pub shutdowns: usize,
    }

    /// Session whose state is shared with the test so it can be changed
    /// while the sampler thread runs.
    #[derive(Clone, Default)]
    pub struct FakeSession {
        pub state: Arc<Mutex<FakeState>>,
    }

    impl FakeSession {
        pub fn with_devices(devices: Vec<FakeDevice>) -> Self {
            let session = Self::default();
            session.state.lock().unwrap().devices = devices;
            session
        }

        pub fn shutdowns(&self) -> usize {
            self.state.lock().unwrap().shutdowns
        }

        pub fn count_calls(&self) -> usize {
            self.state.lock().unwrap().count_calls
        }
    }

    impl DeviceSession for FakeSession {
        fn device_count(&self) -> Result<u32, MonitorError> {
            let (fail, panic, count) = {
                let mut state = self.state.lock().unwrap();
                state.count_calls += 1;
                (state.fail_count, state.panic_on_count, state.devices.len())
            };
            if panic {
                panic!("driver exploded");
            }
            if fail {
                return Err(MonitorError::Query(NvmlError::Unknown));
            }
            Ok(count as u32)
        }

        fn device(&self, index: u32) -> Result<Box<dyn DeviceQuery + '_>, MonitorError> {
            let state = self.state.lock().unwrap();
            if state.lost.contains(&index) {
                return Err(MonitorError::DeviceNotFound(index, NvmlError::GpuLost));
            }
            state
                .devices
                .get(index as usize)
                .cloned()
                .map(|d| Box::new(d) as Box<dyn DeviceQuery>)
                .ok_or(MonitorError::DeviceNotFound(index, NvmlError::InvalidArg))
        }

        fn shutdown(self) {
            self.state.lock().unwrap().shutdowns += 1;
        }
    }
}
