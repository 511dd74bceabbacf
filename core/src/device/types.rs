//! Device capability types and enums.
//!
//! Data types for hardware capability reporting: accelerator class, thermal
//! state, device load bands, and the main `HardwareCapabilities` struct.

use serde::{Deserialize, Serialize};

/// Accelerator class available on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceleratorClass {
    /// CPU only, no dedicated accelerator.
    Cpu,
    /// GPU acceleration (Metal, Vulkan).
    Gpu,
    /// Neural processing unit (Apple Neural Engine, NNAPI).
    Npu,
}

impl AcceleratorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcceleratorClass::Cpu => "cpu",
            AcceleratorClass::Gpu => "gpu",
            AcceleratorClass::Npu => "npu",
        }
    }

    /// Whether this class satisfies a required minimum class.
    ///
    /// Ordering: Cpu < Gpu < Npu.
    pub fn satisfies(&self, required: AcceleratorClass) -> bool {
        self.rank() >= required.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            AcceleratorClass::Cpu => 0,
            AcceleratorClass::Gpu => 1,
            AcceleratorClass::Npu => 2,
        }
    }
}

/// Thermal state for mobile devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThermalState {
    /// Normal operating temperature (< 60°C)
    Normal,
    /// Device is warm, may throttle performance (60-70°C)
    Warm,
    /// Device is hot, should reduce workload (70-80°C)
    Hot,
    /// Critical temperature, should pause heavy operations (> 80°C)
    Critical,
}

impl ThermalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThermalState::Normal => "normal",
            ThermalState::Warm => "warm",
            ThermalState::Hot => "hot",
            ThermalState::Critical => "critical",
        }
    }
}

/// Device load bucketed into five bands.
///
/// Used for diagnostics only; routing decisions do not branch on the band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadBand {
    /// < 20% utilization
    Idle,
    /// 20-40% utilization
    Low,
    /// 40-60% utilization
    Moderate,
    /// 60-80% utilization
    High,
    /// >= 80% utilization
    Critical,
}

impl LoadBand {
    /// Bucket a utilization percentage (0-100) into a band.
    pub fn from_percent(percent: f32) -> Self {
        if percent < 20.0 {
            LoadBand::Idle
        } else if percent < 40.0 {
            LoadBand::Low
        } else if percent < 60.0 {
            LoadBand::Moderate
        } else if percent < 80.0 {
            LoadBand::High
        } else {
            LoadBand::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBand::Idle => "idle",
            LoadBand::Low => "low",
            LoadBand::Moderate => "moderate",
            LoadBand::High => "high",
            LoadBand::Critical => "critical",
        }
    }
}

/// Hardware requirements a model may declare.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareRequirements {
    /// Minimum total device RAM in bytes.
    pub min_memory: u64,
    /// Minimum accelerator class, if the model needs one.
    #[serde(default)]
    pub accelerator: Option<AcceleratorClass>,
}

/// Detected hardware capabilities for the current device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareCapabilities {
    /// Total physical memory in bytes.
    pub total_memory: u64,
    /// Available (free) memory in bytes.
    pub available_memory: u64,
    /// Number of logical CPU cores.
    pub cpu_cores: usize,
    /// Best accelerator class detected.
    pub accelerator: AcceleratorClass,
    /// Current thermal state.
    pub thermal_state: ThermalState,
}

impl HardwareCapabilities {
    pub fn has_accelerator(&self) -> bool {
        self.accelerator != AcceleratorClass::Cpu
    }
}

/// Point-in-time resource snapshot used for routing decisions.
///
/// Snapshots are plain data so that routing stays a pure function of its
/// inputs and tests can construct arbitrary resource situations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Total physical memory in bytes.
    pub total_memory: u64,
    /// Available (free) memory in bytes.
    pub available_memory: u64,
    /// CPU utilization percentage (0-100).
    pub load_percent: f32,
    /// Best accelerator class available.
    pub accelerator: AcceleratorClass,
}

impl DeviceSnapshot {
    /// The diagnostic load band for this snapshot.
    pub fn load_band(&self) -> LoadBand {
        LoadBand::from_percent(self.load_percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_band_boundaries() {
        assert_eq!(LoadBand::from_percent(0.0), LoadBand::Idle);
        assert_eq!(LoadBand::from_percent(19.9), LoadBand::Idle);
        assert_eq!(LoadBand::from_percent(20.0), LoadBand::Low);
        assert_eq!(LoadBand::from_percent(40.0), LoadBand::Moderate);
        assert_eq!(LoadBand::from_percent(60.0), LoadBand::High);
        assert_eq!(LoadBand::from_percent(80.0), LoadBand::Critical);
        assert_eq!(LoadBand::from_percent(100.0), LoadBand::Critical);
    }

    #[test]
    fn accelerator_ordering() {
        assert!(AcceleratorClass::Npu.satisfies(AcceleratorClass::Gpu));
        assert!(AcceleratorClass::Gpu.satisfies(AcceleratorClass::Cpu));
        assert!(!AcceleratorClass::Cpu.satisfies(AcceleratorClass::Gpu));
    }
}
