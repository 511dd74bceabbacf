//! Hardware capability detection.
//!
//! Uses the `sysinfo` crate for memory and CPU detection, plus per-platform
//! accelerator detection. The detected values feed `DeviceSnapshot`s into the
//! routing engine and `HardwareCapabilities` into adapter configuration.

use super::types::{AcceleratorClass, DeviceSnapshot, HardwareCapabilities, ThermalState};
use sysinfo::{Components, System};

/// Detects hardware capabilities for the current platform.
///
/// Memory and CPU figures come from `sysinfo`; the accelerator class is a
/// per-platform compile-time guess (Apple platforms ship a neural engine,
/// Android exposes NNAPI, desktop Linux/Windows are treated as GPU-capable).
pub fn detect_capabilities() -> HardwareCapabilities {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_usage();

    HardwareCapabilities {
        total_memory: sys.total_memory(),
        available_memory: sys.available_memory(),
        cpu_cores: sys.cpus().len().max(1),
        accelerator: detect_accelerator(),
        thermal_state: detect_thermal_state(),
    }
}

/// Hottest temperature sensor, bucketed. Platforms exposing no sensors
/// report `Normal`.
fn detect_thermal_state() -> ThermalState {
    let components = Components::new_with_refreshed_list();
    let hottest = components
        .iter()
        .map(|c| c.temperature())
        .fold(f32::NAN, f32::max);
    thermal_from_celsius(hottest)
}

fn thermal_from_celsius(celsius: f32) -> ThermalState {
    if !celsius.is_finite() || celsius < 60.0 {
        ThermalState::Normal
    } else if celsius < 70.0 {
        ThermalState::Warm
    } else if celsius < 80.0 {
        ThermalState::Hot
    } else {
        ThermalState::Critical
    }
}

/// Takes a point-in-time resource snapshot for routing.
pub fn snapshot() -> DeviceSnapshot {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_usage();

    let load_percent = global_cpu_percent(&sys);

    DeviceSnapshot {
        total_memory: sys.total_memory(),
        available_memory: sys.available_memory(),
        load_percent,
        accelerator: detect_accelerator(),
    }
}

fn global_cpu_percent(sys: &System) -> f32 {
    let cpus = sys.cpus();
    if cpus.is_empty() {
        return 0.0;
    }
    let sum: f32 = cpus.iter().map(|c| c.cpu_usage()).sum();
    sum / cpus.len() as f32
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn detect_accelerator() -> AcceleratorClass {
    AcceleratorClass::Npu
}

#[cfg(target_os = "android")]
fn detect_accelerator() -> AcceleratorClass {
    AcceleratorClass::Npu
}

#[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "android")))]
fn detect_accelerator() -> AcceleratorClass {
    AcceleratorClass::Gpu
}
