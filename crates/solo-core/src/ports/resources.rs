//! ResourceMeter port - バッテリー・負荷・メモリ・ディスクの計測
//!
//! 計測値が取れない項目（デスクトップのバッテリー等）は `None` で、
//! `None` は決してゲートを閉じません。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One reading of the host's resources.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Battery percentage (0-100).
    pub battery: Option<u8>,
    pub charging: Option<bool>,
    /// 1-minute load average divided by CPU count.
    pub load_per_cpu: Option<f64>,
    pub memory_pct: Option<f64>,
    pub disk_pct: Option<f64>,
}

/// Ceilings that gate whether a node may claim at all.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Minimum battery percentage while discharging.
    pub min_battery: u8,
    pub max_load_per_cpu: f64,
    pub max_memory_pct: f64,
    pub max_disk_pct: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            min_battery: 20,
            max_load_per_cpu: 2.0,
            max_memory_pct: 90.0,
            max_disk_pct: 95.0,
        }
    }
}

impl ResourceLimits {
    /// `Err(reason)` when any measured value is past its ceiling.
    pub fn check(&self, sample: &ResourceSample) -> Result<(), String> {
        if let Some(battery) = sample.battery {
            if battery < self.min_battery && sample.charging != Some(true) {
                return Err(format!("battery {battery}% below {}%", self.min_battery));
            }
        }
        if let Some(load) = sample.load_per_cpu {
            if load > self.max_load_per_cpu {
                return Err(format!(
                    "load {load:.2}/cpu above {:.2}",
                    self.max_load_per_cpu
                ));
            }
        }
        if let Some(mem) = sample.memory_pct {
            if mem > self.max_memory_pct {
                return Err(format!("memory {mem:.0}% above {:.0}%", self.max_memory_pct));
            }
        }
        if let Some(disk) = sample.disk_pct {
            if disk > self.max_disk_pct {
                return Err(format!("disk {disk:.0}% above {:.0}%", self.max_disk_pct));
            }
        }
        Ok(())
    }
}

#[async_trait]
pub trait ResourceMeter: Send + Sync {
    async fn sample(&self) -> ResourceSample;
}
