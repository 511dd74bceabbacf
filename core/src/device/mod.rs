//! Hardware capability provider.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`types`] | Data types (AcceleratorClass, LoadBand, DeviceSnapshot) |
//! | [`capabilities`] | sysinfo-backed detection |

mod capabilities;
mod types;

pub use capabilities::{detect_capabilities, snapshot};
pub use types::{
    AcceleratorClass, DeviceSnapshot, HardwareCapabilities, HardwareRequirements, LoadBand,
    ThermalState,
};
