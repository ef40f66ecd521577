//! Power source probing for the low-battery skip.

use std::path::{Path, PathBuf};
use std::process::Command;

static SYSFS_POWER_SUPPLY: &str = "/sys/class/power_supply";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PowerStatus {
    /// Charge in percent, 0..=100.
    pub level: u8,
    pub on_battery: bool,
    pub has_battery: bool,
}

impl PowerStatus {
    /// Machines without a battery, or where probing failed.
    pub fn mains() -> Self {
        Self {
            level: 100,
            on_battery: false,
            has_battery: false,
        }
    }

    pub fn should_skip(&self, threshold: u8) -> bool {
        self.has_battery && self.on_battery && self.level < threshold
    }
}

pub trait PowerSource: Send + Sync {
    fn status(&self) -> PowerStatus;
}

/// Reads the host's power state. Unknown platforms and probe failures report mains power.
#[derive(Clone, Debug)]
pub struct SystemPower {
    sysfs_root: PathBuf,
}

impl Default for SystemPower {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(SYSFS_POWER_SUPPLY),
        }
    }
}

impl PowerSource for SystemPower {
    fn status(&self) -> PowerStatus {
        let status = if cfg!(target_os = "macos") {
            pmset_status()
        } else if cfg!(target_os = "linux") {
            sysfs_status(&self.sysfs_root)
        } else {
            None
        };
        status.unwrap_or_else(PowerStatus::mains)
    }
}

fn pmset_status() -> Option<PowerStatus> {
    let output = match Command::new("pmset").args(["-g", "batt"]).output() {
        Ok(o) if o.status.success() => o,
        Ok(o) => {
            tracing::warn!("pmset exited with {}", o.status);
            return None;
        }
        Err(e) => {
            tracing::warn!("Cannot run pmset: {}", e);
            return None;
        }
    };
    Some(parse_pmset(&String::from_utf8_lossy(&output.stdout)))
}

/// Parses `pmset -g batt`, e.g.
///
/// ```text
/// Now drawing from 'Battery Power'
///  -InternalBattery-0 (id=1234567)	75%; discharging; 3:45 remaining present: true
/// ```
pub fn parse_pmset(output: &str) -> PowerStatus {
    let mut lines = output.lines();
    let on_ac = lines.next().is_some_and(|l| l.contains("AC Power"));
    let Some(battery) = lines.find(|l| l.contains("InternalBattery") || l.contains('%')) else {
        return PowerStatus::mains();
    };

    let level = battery
        .split(|c: char| c.is_whitespace() || c == ';')
        .find_map(|tok| tok.strip_suffix('%'))
        .and_then(|n| n.parse::<u8>().ok())
        .unwrap_or(100)
        .min(100);
    let lower = battery.to_lowercase();
    let discharging = lower.contains("discharging");
    let charging = !discharging
        && (lower.contains("charging") || lower.contains("charged") || lower.contains("finishing charge"));

    PowerStatus {
        level,
        on_battery: !charging && !(on_ac && !discharging),
        has_battery: true,
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Reads `<root>/<supply>/{type,capacity,status,online}`.
pub fn sysfs_status<P: AsRef<Path>>(root: P) -> Option<PowerStatus> {
    let supplies = std::fs::read_dir(root.as_ref()).ok()?;

    let mut battery: Option<(u8, bool)> = None;
    let mut mains_online = false;
    for supply in supplies.filter_map(|r| r.ok()).map(|e| e.path()) {
        match read_trimmed(&supply.join("type")).as_deref() {
            Some("Battery") => {
                let level = read_trimmed(&supply.join("capacity"))
                    .and_then(|c| c.parse::<u8>().ok())
                    .unwrap_or(100)
                    .min(100);
                let discharging = read_trimmed(&supply.join("status"))
                    .is_some_and(|s| s.eq_ignore_ascii_case("discharging"));
                // Lowest charged battery wins when there are several.
                battery = match battery {
                    Some((l, d)) if l <= level => Some((l, d || discharging)),
                    Some((_, d)) => Some((level, d || discharging)),
                    None => Some((level, discharging)),
                };
            }
            Some("Mains") | Some("USB") => {
                mains_online |= read_trimmed(&supply.join("online")).as_deref() == Some("1");
            }
            _ => {}
        }
    }

    Some(match battery {
        None => PowerStatus::mains(),
        Some((level, discharging)) => PowerStatus {
            level,
            on_battery: discharging && !mains_online,
            has_battery: true,
        },
    })
}
