//! Host resource meters.
//!
//! `SystemMeter` reads Linux/Android interfaces (`/sys/class/power_supply`,
//! `dumpsys battery`, `/proc/loadavg`, `/proc/meminfo`, `df -P`). Anything it
//! cannot read stays `None` and never gates a claim.

use std::path::PathBuf;

use async_trait::async_trait;

use super::command;
use crate::ports::{ResourceMeter, ResourceSample};

#[derive(Debug, Clone)]
pub struct SystemMeter {
    /// Directory whose file system is checked for free space.
    data_dir: PathBuf,
}

impl SystemMeter {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    async fn battery(&self) -> (Option<u8>, Option<bool>) {
        if let Ok(mut entries) = tokio::fs::read_dir("/sys/class/power_supply").await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let dir = entry.path();
                let Ok(capacity) = tokio::fs::read_to_string(dir.join("capacity")).await else {
                    continue;
                };
                let Ok(level) = capacity.trim().parse::<u8>() else {
                    continue;
                };
                let status = tokio::fs::read_to_string(dir.join("status"))
                    .await
                    .ok()
                    .map(|s| matches!(s.trim(), "Charging" | "Full"));
                return (Some(level.min(100)), status);
            }
        }
        match command::run("dumpsys", &["battery"], None).await {
            Ok(out) if out.success => parse_dumpsys_battery(&out.stdout),
            _ => (None, None),
        }
    }

    async fn disk_pct(&self) -> Option<f64> {
        let dir = self.data_dir.to_string_lossy().to_string();
        let out = command::run("df", &["-P", &dir], None).await.ok()?;
        if !out.success {
            return None;
        }
        parse_df(&out.stdout)
    }
}

#[async_trait]
impl ResourceMeter for SystemMeter {
    async fn sample(&self) -> ResourceSample {
        let (battery, charging) = self.battery().await;
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let load_per_cpu = tokio::fs::read_to_string("/proc/loadavg")
            .await
            .ok()
            .and_then(|s| parse_loadavg(&s))
            .map(|load| load / cpus as f64);
        let memory_pct = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .ok()
            .and_then(|s| parse_meminfo(&s));
        ResourceSample {
            battery,
            charging,
            load_per_cpu,
            memory_pct,
            disk_pct: self.disk_pct().await,
        }
    }
}

/// Fixed reading, for tests and for hosts where probing is unwanted.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticMeter(pub ResourceSample);

#[async_trait]
impl ResourceMeter for StaticMeter {
    async fn sample(&self) -> ResourceSample {
        self.0
    }
}

fn parse_dumpsys_battery(out: &str) -> (Option<u8>, Option<bool>) {
    let mut level = None;
    let mut charging = None;
    for line in out.lines().map(str::trim) {
        if let Some(v) = line.strip_prefix("level:") {
            level = v.trim().parse::<u8>().ok();
        } else if let Some(v) = line.strip_prefix("status:") {
            // BatteryManager: 2 = charging, 5 = full
            charging = v.trim().parse::<u8>().ok().map(|s| s == 2 || s == 5);
        }
    }
    (level, charging)
}

fn parse_loadavg(s: &str) -> Option<f64> {
    s.split_whitespace().next()?.parse().ok()
}

fn parse_meminfo(s: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        s.lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some((total - available) / total * 100.0)
}

fn parse_df(s: &str) -> Option<f64> {
    let line = s.lines().nth(1)?;
    let pct = line.split_whitespace().nth(4)?;
    pct.trim_end_matches('%').parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dumpsys_battery() {
        let out = "Current Battery Service state:\n  AC powered: false\n  status: 3\n  level: 57\n  scale: 100\n";
        assert_eq!(parse_dumpsys_battery(out), (Some(57), Some(false)));
        assert_eq!(parse_dumpsys_battery("  status: 2\n"), (None, Some(true)));
    }

    #[test]
    fn parses_proc_files() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 1/467 12345\n"), Some(0.52));
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        assert_eq!(parse_meminfo(meminfo), Some(75.0));
        assert_eq!(parse_meminfo("MemTotal: 10 kB\n"), None);
    }

    #[test]
    fn parses_df_capacity() {
        let out = "Filesystem     1024-blocks     Used Available Capacity Mounted on\n/dev/sda1        102400000 51200000  51200000      50% /\n";
        assert_eq!(parse_df(out), Some(50.0));
        assert_eq!(parse_df("Filesystem\n"), None);
    }

    #[tokio::test]
    async fn static_meter_returns_its_sample() {
        let sample = ResourceSample {
            battery: Some(12),
            ..Default::default()
        };
        assert_eq!(StaticMeter(sample).sample().await, sample);
    }
}
