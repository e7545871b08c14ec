use serde::Serialize;

const MB: u64 = 1024 * 1024;

// Per-device telemetry for one sample cycle. Every field has a zero/empty default.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub index: u32,
    pub name: String,
    pub utilization_compute: u32,
    pub utilization_memory_bandwidth: u32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    /// 0 means the sensor could not be read.
    pub temperature_c: u32,
    pub power_usage_w: f64,
    /// 0 when the limit is unknown.
    pub power_limit_w: f64,
    /// One entry per physical fan. Empty when no fan data is available.
    pub fan_speeds: Vec<u32>,
    pub processes: Vec<ProcessUsage>,
}

// A process currently holding memory on a device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProcessUsage {
    pub pid: u32,
    pub memory_used_mb: u64,
}

// Used/total memory as reported by one accounting source, in MB
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryReading {
    pub used_mb: u64,
    pub total_mb: u64,
}

impl MemoryReading {
    pub fn from_bytes(used: u64, total: u64) -> Self {
        Self {
            used_mb: used / MB,
            total_mb: total / MB,
        }
    }

    /// Clamps `used` to `total` when the total is known.
    pub fn clamped(self) -> Self {
        if self.total_mb > 0 && self.used_mb > self.total_mb {
            Self {
                used_mb: self.total_mb,
                ..self
            }
        } else {
            self
        }
    }
}

pub fn bytes_to_mb(bytes: u64) -> u64 {
    bytes / MB
}

/// Coarse load bucket used to pick a bar color.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadLevel {
    Low,
    Medium,
    High,
}

impl LoadLevel {
    pub fn from_percent(percent: f64) -> Self {
        if percent < 50.0 {
            LoadLevel::Low
        } else if percent < 80.0 {
            LoadLevel::Medium
        } else {
            LoadLevel::High
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemperatureLevel {
    Normal,
    Warm,
    Hot,
}

impl TemperatureLevel {
    pub fn from_celsius(temperature_c: u32) -> Self {
        if temperature_c < 50 {
            TemperatureLevel::Normal
        } else if temperature_c < 70 {
            TemperatureLevel::Warm
        } else {
            TemperatureLevel::Hot
        }
    }
}

impl DeviceSnapshot {
    pub fn memory_percent(&self) -> f64 {
        if self.memory_total_mb == 0 {
            return 0.0;
        }
        self.memory_used_mb as f64 / self.memory_total_mb as f64 * 100.0
    }

    pub fn power_percent(&self) -> f64 {
        if self.power_limit_w <= 0.0 {
            return 0.0;
        }
        self.power_usage_w / self.power_limit_w * 100.0
    }

    pub fn temperature_level(&self) -> TemperatureLevel {
        TemperatureLevel::from_celsius(self.temperature_c)
    }

    /// Short memory label, e.g. `1.5G/8G`.
    pub fn memory_label(&self) -> String {
        format!(
            "{:.1}G/{:.0}G",
            self.memory_used_mb as f64 / 1024.0,
            self.memory_total_mb as f64 / 1024.0
        )
    }

    /// `None` when there is no fan data to show.
    pub fn fan_label(&self) -> Option<String> {
        if self.fan_speeds.is_empty() {
            return None;
        }
        let speeds: Vec<String> = self.fan_speeds.iter().map(|s| format!("{s}%")).collect();
        Some(format!("Fan Speed: {}", speeds.join(" / ")))
    }
}

/// Formats the overlay's own resident memory. Returns `None` for 0 (unavailable).
pub fn app_memory_label(memory_mb: f64) -> Option<String> {
    if memory_mb <= 0.0 {
        None
    } else if memory_mb < 1024.0 {
        Some(format!("App Memory: {memory_mb:.1} MB"))
    } else {
        Some(format!("App Memory: {:.2} GB", memory_mb / 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> DeviceSnapshot {
        DeviceSnapshot {
            name: "Test GPU".to_string(),
            memory_used_mb: 1536,
            memory_total_mb: 8192,
            power_usage_w: 150.0,
            power_limit_w: 300.0,
            ..Default::default()
        }
    }

    #[test]
    fn default_snapshot_is_all_zero() {
        let snap = DeviceSnapshot::default();
        assert_eq!(snap.temperature_c, 0);
        assert!(snap.fan_speeds.is_empty());
        assert!(snap.processes.is_empty());
        assert_eq!(snap.memory_percent(), 0.0);
        assert_eq!(snap.power_percent(), 0.0);
        assert_eq!(snap.fan_label(), None);
    }

    #[test]
    fn reading_from_bytes_truncates_to_mb() {
        let reading = MemoryReading::from_bytes(3 * MB + 512, 8 * MB);
        assert_eq!(reading.used_mb, 3);
        assert_eq!(reading.total_mb, 8);
    }

    #[test]
    fn clamped_caps_used_only_when_total_known() {
        let over = MemoryReading { used_mb: 9000, total_mb: 8192 }.clamped();
        assert_eq!(over.used_mb, 8192);

        let unknown = MemoryReading { used_mb: 10, total_mb: 0 }.clamped();
        assert_eq!(unknown.used_mb, 10);
    }

    #[test]
    fn percentages_and_labels() {
        let snap = snapshot();
        assert_eq!(snap.memory_percent(), 18.75);
        assert_eq!(snap.power_percent(), 50.0);
        assert_eq!(snap.memory_label(), "1.5G/8G");
    }

    #[test]
    fn fan_label_joins_fans_in_order() {
        let mut snap = snapshot();
        snap.fan_speeds = vec![45];
        assert_eq!(snap.fan_label().as_deref(), Some("Fan Speed: 45%"));
        snap.fan_speeds = vec![45, 47];
        assert_eq!(snap.fan_label().as_deref(), Some("Fan Speed: 45% / 47%"));
    }

    #[test]
    fn level_thresholds() {
        assert_eq!(LoadLevel::from_percent(49.9), LoadLevel::Low);
        assert_eq!(LoadLevel::from_percent(50.0), LoadLevel::Medium);
        assert_eq!(LoadLevel::from_percent(80.0), LoadLevel::High);
        assert_eq!(TemperatureLevel::from_celsius(49), TemperatureLevel::Normal);
        assert_eq!(TemperatureLevel::from_celsius(50), TemperatureLevel::Warm);
        assert_eq!(TemperatureLevel::from_celsius(70), TemperatureLevel::Hot);
    }

    #[test]
    fn app_memory_label_switches_units() {
        assert_eq!(app_memory_label(0.0), None);
        assert_eq!(app_memory_label(12.34).as_deref(), Some("App Memory: 12.3 MB"));
        assert_eq!(app_memory_label(2048.0).as_deref(), Some("App Memory: 2.00 GB"));
    }
}
