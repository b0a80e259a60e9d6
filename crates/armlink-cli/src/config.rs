//! Arm configuration – reads/writes `~/.armlink/armlink.toml`.
//!
//! ```toml
//! [leader]
//! port = "/dev/ttyACM0"
//!
//! [leader.calibration.shoulder_pan]
//! id = 1
//! range_min = 812
//! range_max = 3310
//!
//! [follower]
//! port = "/dev/ttyACM1"
//! calibration_file = "follower.json"
//!
//! [teleop]
//! hz = 60
//! mirror = false
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use armlink_hal::Calibration;
use armlink_runtime::DEFAULT_HZ;
use serde::{Deserialize, Serialize};

/// One arm: its serial port and where its calibration comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmConfig {
    pub port: String,

    /// JSON calibration record, relative paths resolved against the config
    /// file's directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_file: Option<PathBuf>,

    /// Inline calibration. Wins over `calibration_file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<Calibration>,
}

impl ArmConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            calibration_file: None,
            calibration: None,
        }
    }

    /// `true` when a calibration source is configured.
    pub fn is_calibrated(&self) -> bool {
        self.calibration.as_ref().is_some_and(|c| !c.is_empty()) || self.calibration_file.is_some()
    }

    /// Load the calibration this arm should run with.
    pub fn resolve_calibration(&self, base_dir: &Path) -> Result<Calibration, String> {
        if let Some(calibration) = &self.calibration {
            return Ok(calibration.clone());
        }
        let Some(file) = &self.calibration_file else {
            return Err(format!("arm on {} is not calibrated", self.port));
        };
        let path = if file.is_absolute() {
            file.clone()
        } else {
            base_dir.join(file)
        };
        Calibration::load(&path).map_err(|e| format!("Failed to load {}: {}", path.display(), e))
    }
}

/// Loop settings for `armlink teleoperate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeleopSection {
    #[serde(default = "default_hz")]
    pub hz: i64,
    #[serde(default)]
    pub mirror: bool,
}

fn default_hz() -> i64 {
    i64::from(DEFAULT_HZ)
}

impl Default for TeleopSection {
    fn default() -> Self {
        Self {
            hz: default_hz(),
            mirror: false,
        }
    }
}

/// Persisted configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<ArmConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follower: Option<ArmConfig>,

    #[serde(default)]
    pub teleop: TeleopSection,
}

impl Config {
    /// `true` when both arms have a port and a calibration source.
    pub fn is_ready(&self) -> bool {
        [&self.leader, &self.follower]
            .iter()
            .all(|arm| arm.as_ref().is_some_and(ArmConfig::is_calibrated))
    }
}

/// Return the path to `~/.armlink/armlink.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".armlink").join("armlink.toml")
}

/// Load the config from `path` and apply `ARMLINK_*` overrides. Returns
/// `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `ARMLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ARMLINK_LEADER_PORT` | `leader.port` |
/// | `ARMLINK_FOLLOWER_PORT` | `follower.port` |
/// | `ARMLINK_HZ` | `teleop.hz` (ignored unless an integer) |
/// | `ARMLINK_MIRROR` | `teleop.mirror` (`1`/`true`/`0`/`false`) |
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(port) = lookup("ARMLINK_LEADER_PORT") {
        set_port(&mut cfg.leader, port);
    }
    if let Some(port) = lookup("ARMLINK_FOLLOWER_PORT") {
        set_port(&mut cfg.follower, port);
    }
    if let Some(v) = lookup("ARMLINK_HZ")
        && let Ok(hz) = v.trim().parse::<i64>()
    {
        cfg.teleop.hz = hz;
    }
    if let Some(v) = lookup("ARMLINK_MIRROR") {
        match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" => cfg.teleop.mirror = true,
            "0" | "false" => cfg.teleop.mirror = false,
            _ => {}
        }
    }
}

fn set_port(arm: &mut Option<ArmConfig>, port: String) {
    match arm {
        Some(arm) => arm.port = port,
        None => *arm = Some(ArmConfig::new(port)),
    }
}

/// Save the config to `path` with owner-only permissions on Unix.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
