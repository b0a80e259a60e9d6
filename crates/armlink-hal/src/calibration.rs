//! Per-motor linear mapping between raw servo units and the normalized
//! `[-100, 100]` range.
//!
//! `-100` is the recorded minimum, `100` the recorded maximum. Values are
//! not clamped: an arm pushed past its recorded range reports positions
//! outside `[-100, 100]`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use armlink_types::{ArmError, MotorName};
use serde::{Deserialize, Serialize};

/// Calibration record of a single motor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorCalibration {
    /// Servo address on the bus.
    pub id: u8,
    /// Carried through unexamined.
    #[serde(default)]
    pub drive_mode: i32,
    /// Carried through unexamined.
    #[serde(default)]
    pub homing_offset: i32,
    pub range_min: i32,
    pub range_max: i32,
}

impl MotorCalibration {
    pub fn new(id: u8, range_min: i32, range_max: i32) -> Self {
        Self {
            id,
            range_min,
            range_max,
            ..Self::default()
        }
    }

    /// Width of the recorded range in raw units.
    pub fn span(&self) -> i64 {
        i64::from(self.range_max) - i64::from(self.range_min)
    }

    /// Raw position → normalized position. A zero-width range maps to `0`.
    pub fn normalize(&self, raw: i32) -> f64 {
        let span = self.span() as f64;
        if span == 0.0 {
            return 0.0;
        }
        ((f64::from(raw) - f64::from(self.range_min)) / span) * 200.0 - 100.0
    }

    /// Normalized position → raw position, truncated toward zero.
    pub fn denormalize(&self, norm: f64) -> i32 {
        let span = self.span() as f64;
        let offset = ((norm + 100.0) / 200.0 * span).trunc();
        (offset + f64::from(self.range_min)) as i32
    }
}

/// Calibration of a whole arm, keyed by motor.
///
/// Serialized as a flat map from motor name to [`MotorCalibration`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, MotorCalibration>",
    into = "BTreeMap<String, MotorCalibration>"
)]
pub struct Calibration(BTreeMap<MotorName, MotorCalibration>);

impl Calibration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, motor: MotorName, calibration: MotorCalibration) {
        self.0.insert(motor, calibration);
    }

    pub fn get(&self, motor: MotorName) -> Option<&MotorCalibration> {
        self.0.get(&motor)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (MotorName, &MotorCalibration)> {
        self.0.iter().map(|(name, cal)| (*name, cal))
    }

    /// Servo addresses of every calibrated motor, in canonical motor order.
    pub fn motor_ids(&self) -> Vec<u8> {
        MotorName::ALL
            .iter()
            .filter_map(|name| self.0.get(name).map(|cal| cal.id))
            .collect()
    }

    /// Motor bound to `address`, or `None` when no calibrated motor uses it.
    pub fn by_id(&self, address: u8) -> Option<(MotorName, &MotorCalibration)> {
        self.iter().find(|(_, cal)| cal.id == address)
    }

    /// Check that all six motors are present with distinct addresses.
    pub fn validate(&self) -> Result<(), ArmError> {
        let missing: Vec<&str> = MotorName::ALL
            .iter()
            .filter(|name| !self.0.contains_key(name))
            .map(|name| name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(ArmError::Calibration(format!(
                "missing motors: {}",
                missing.join(", ")
            )));
        }
        let mut ids = self.motor_ids();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != MotorName::ALL.len() {
            return Err(ArmError::Calibration(
                "two motors share the same servo id".to_string(),
            ));
        }
        Ok(())
    }

    /// Load a calibration record from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ArmError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ArmError::Calibration(format!("read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| ArmError::Calibration(format!("parse {}: {e}", path.display())))
    }

    /// Write the calibration record as pretty-printed JSON, creating parent
    /// directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), ArmError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| ArmError::Calibration(format!("create {}: {e}", parent.display())))?;
        }
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| ArmError::Calibration(format!("serialize: {e}")))?;
        fs::write(path, raw)
            .map_err(|e| ArmError::Calibration(format!("write {}: {e}", path.display())))
    }
}

impl TryFrom<BTreeMap<String, MotorCalibration>> for Calibration {
    type Error = ArmError;

    fn try_from(raw: BTreeMap<String, MotorCalibration>) -> Result<Self, Self::Error> {
        raw.into_iter()
            .map(|(name, cal)| Ok((name.parse::<MotorName>()?, cal)))
            .collect()
    }
}

impl From<Calibration> for BTreeMap<String, MotorCalibration> {
    fn from(cal: Calibration) -> Self {
        cal.0
            .into_iter()
            .map(|(name, mc)| (name.as_str().to_string(), mc))
            .collect()
    }
}

impl FromIterator<(MotorName, MotorCalibration)> for Calibration {
    fn from_iter<I: IntoIterator<Item = (MotorName, MotorCalibration)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_calibration() -> Calibration {
        MotorName::ALL
            .iter()
            .map(|&m| (m, MotorCalibration::new(m.default_address(), 1000, 3000)))
            .collect()
    }

    #[test]
    fn normalize_maps_recorded_range() {
        let cal = MotorCalibration::new(1, 1000, 3000);
        for (raw, expected) in [
            (1000, -100.0),
            (3000, 100.0),
            (2000, 0.0),
            (1500, -50.0),
            (2500, 50.0),
        ] {
            let got = cal.normalize(raw);
            assert!((got - expected).abs() < 1e-3, "normalize({raw}) = {got}");
        }
    }

    #[test]
    fn normalize_does_not_clamp_overtravel() {
        let cal = MotorCalibration::new(1, 1000, 3000);
        assert!((cal.normalize(3500) - 150.0).abs() < 1e-9);
        assert!((cal.normalize(500) + 150.0).abs() < 1e-9);
    }

    #[test]
    fn denormalize_maps_back_to_raw() {
        let cal = MotorCalibration::new(1, 1000, 3000);
        for (norm, expected) in [
            (-100.0, 1000),
            (100.0, 3000),
            (0.0, 2000),
            (-50.0, 1500),
            (50.0, 2500),
        ] {
            assert_eq!(cal.denormalize(norm), expected, "denormalize({norm})");
        }
    }

    #[test]
    fn round_trip_stays_within_one_unit() {
        let cal = MotorCalibration::new(1, 823, 3540);
        for raw in cal.range_min..=cal.range_max {
            let back = cal.denormalize(cal.normalize(raw));
            assert!((back - raw).abs() <= 1, "{raw} -> {back}");
        }
    }

    #[test]
    fn degenerate_range_normalizes_to_zero() {
        let cal = MotorCalibration::new(1, 2048, 2048);
        assert_eq!(cal.normalize(2048), 0.0);
        assert_eq!(cal.normalize(0), 0.0);
        assert_eq!(cal.normalize(4095), 0.0);
        assert_eq!(cal.denormalize(42.0), 2048);
    }

    #[test]
    fn extreme_bounds_do_not_overflow() {
        let cal = MotorCalibration::new(1, i32::MIN, i32::MAX);
        assert_eq!(cal.span(), i64::from(u32::MAX));
        assert!((cal.normalize(i32::MAX) - 100.0).abs() < 1e-6);
        assert!((cal.normalize(i32::MIN) + 100.0).abs() < 1e-6);
        assert_eq!(cal.denormalize(-100.0), i32::MIN);
        assert_eq!(cal.denormalize(100.0), i32::MAX);
        assert_eq!(cal.denormalize(1e9), i32::MAX);
    }

    #[test]
    fn motor_ids_follow_canonical_order() {
        let cal = full_calibration();
        assert_eq!(cal.motor_ids(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn by_id_finds_configured_addresses_only() {
        let mut cal = Calibration::new();
        cal.insert(MotorName::ShoulderPan, MotorCalibration::new(1, 100, 200));
        cal.insert(MotorName::Gripper, MotorCalibration::new(6, 300, 400));

        let (name, mc) = cal.by_id(1).expect("id 1 is calibrated");
        assert_eq!(name, MotorName::ShoulderPan);
        assert_eq!(mc.range_min, 100);

        let (name, _) = cal.by_id(6).expect("id 6 is calibrated");
        assert_eq!(name, MotorName::Gripper);

        assert!(cal.by_id(99).is_none());
        assert!(cal.by_id(0).is_none());
    }

    #[test]
    fn validate_rejects_missing_and_duplicate_motors() {
        assert!(full_calibration().validate().is_ok());

        let mut partial = full_calibration();
        partial.0.remove(&MotorName::WristRoll);
        let err = partial.validate().unwrap_err();
        assert!(err.to_string().contains("wrist_roll"));

        let mut duplicate = full_calibration();
        duplicate.insert(MotorName::Gripper, MotorCalibration::new(1, 0, 10));
        assert!(duplicate.validate().is_err());
    }

    #[test]
    fn load_reads_calibration_record() {
        let content = r#"{
            "shoulder_pan": {
                "id": 1, "drive_mode": 0, "homing_offset": 978,
                "range_min": 823, "range_max": 3540
            },
            "gripper": {
                "id": 6, "drive_mode": 0, "homing_offset": 1025,
                "range_min": 2041, "range_max": 3275
            }
        }"#;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("leader.json");
        fs::write(&path, content).expect("write");

        let cal = Calibration::load(&path).expect("load");
        let sp = cal.get(MotorName::ShoulderPan).expect("shoulder_pan");
        assert_eq!((sp.id, sp.range_min, sp.range_max), (1, 823, 3540));
        assert_eq!(sp.homing_offset, 978);
        let gr = cal.get(MotorName::Gripper).expect("gripper");
        assert_eq!((gr.id, gr.range_min, gr.range_max), (6, 2041, 3275));
    }

    #[test]
    fn save_then_load_preserves_passthrough_fields() {
        let mut cal = full_calibration();
        cal.insert(
            MotorName::ElbowFlex,
            MotorCalibration {
                id: 3,
                drive_mode: 1,
                homing_offset: -12,
                range_min: 900,
                range_max: 3100,
            },
        );
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("calibration").join("follower.json");
        cal.save(&path).expect("save");
        assert_eq!(Calibration::load(&path).expect("load"), cal);
    }

    #[test]
    fn load_rejects_unknown_motor() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{"tail": {"id": 7, "range_min": 0, "range_max": 1}}"#).unwrap();
        assert!(matches!(
            Calibration::load(&path),
            Err(ArmError::Calibration(_))
        ));
    }
}
