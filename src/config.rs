// src/config.rs - Machine configuration: per-axis limits, mapping strings, flags

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::axis::Axis;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid negative feedrate {feedrate} for axis {axis}")]
    NegativeFeedrate { axis: char, feedrate: f64 },
    #[error("invalid negative acceleration {accel} for axis {axis}")]
    NegativeAcceleration { axis: char, accel: f64 },
    #[error("axis mapping '{mapping}' has more elements than {max} available connectors")]
    MappingTooLong { mapping: String, max: usize },
    #[error("illegal axis->connector mapping character '{ch}' in '{mapping}' (only valid axis letters or '_' to skip a connector)")]
    BadMappingChar { ch: char, mapping: String },
    #[error("illegal endswitch polarity character '{ch}' in '{polarity}'")]
    BadPolarityChar { ch: char, polarity: String },
    #[error("illegal axis->endswitch mapping character '{ch}' in '{mapping}'")]
    BadEndstopChar { ch: char, mapping: String },
    #[error("endswitch mapping '{mapping}' has more elements than {max} available switch connectors")]
    EndstopMappingTooLong { mapping: String, max: usize },
    #[error("endstop for axis {axis} defined at max-endswitch, but no move range was given for that axis")]
    MaxEndstopWithoutRange { axis: char },
    #[error("axis {axis} has both min and max endstops flagged for homing; only one home origin is allowed")]
    TwoHomeEndstops { axis: char },
    #[error("axis {axis} is mapped to a driver but has an invalid feedrate or steps/mm")]
    UnusableAxis { axis: char },
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Machine configuration, loadable from TOML.
///
/// The per-axis vectors follow canonical axis order (X, Y, Z, E, A, ...);
/// axes beyond the end of a vector default to zero and are treated as
/// unconfigured. `steps_per_mm` may be negative; the sign flips the axis
/// direction and the magnitude is used everywhere else.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MachineConfig {
    #[serde(default = "default_steps_per_mm")]
    pub steps_per_mm: Vec<f64>,

    /// Maximum per-axis travel speed, mm/s.
    #[serde(default = "default_max_feedrate")]
    pub max_feedrate: Vec<f64>,

    /// Maximum per-axis acceleration, mm/s^2.
    #[serde(default = "default_acceleration")]
    pub acceleration: Vec<f64>,

    /// Per-axis travel range in mm; zero or negative means unbounded.
    #[serde(default)]
    pub move_range_mm: Vec<f64>,

    /// Driver connector mapping, left to right. '_' skips a connector,
    /// a lowercase letter reverses that driver.
    #[serde(default = "default_axis_mapping")]
    pub axis_mapping: String,

    /// Per switch connector: '_', '0', '-' or 'L' trigger low;
    /// '1', '+' or 'H' trigger high.
    #[serde(default)]
    pub endswitch_polarity: String,

    /// Axis letter per min-endswitch connector; uppercase flags the switch
    /// for homing, '_' skips.
    #[serde(default)]
    pub min_endswitch: String,

    #[serde(default)]
    pub max_endswitch: String,

    /// Order in which axes are homed, e.g. "ZXY".
    #[serde(default = "default_home_order")]
    pub home_order: String,

    /// Refuse motion commands until the machine has been homed.
    #[serde(default)]
    pub require_homing: bool,

    /// Reject moves outside the machine cube.
    #[serde(default = "default_true")]
    pub range_check: bool,

    /// Drain the motor queue before enqueueing each segment.
    #[serde(default)]
    pub synchronous: bool,

    /// Corners sharper than this (degrees) force a junction speed change.
    #[serde(default = "default_threshold_angle")]
    pub threshold_angle: f64,

    /// Global multiplier applied to all requested feedrates.
    #[serde(default = "default_speed_factor")]
    pub speed_factor: f64,
}

fn default_steps_per_mm() -> Vec<f64> {
    vec![160.0, 160.0, 160.0, 40.0, 1.0]
}
fn default_max_feedrate() -> Vec<f64> {
    vec![200.0, 200.0, 90.0, 10.0, 1.0]
}
fn default_acceleration() -> Vec<f64> {
    vec![4000.0, 4000.0, 1000.0, 10000.0, 1.0]
}
fn default_axis_mapping() -> String {
    "XYZEA".to_string()
}
fn default_home_order() -> String {
    "ZXY".to_string()
}
fn default_true() -> bool {
    true
}
fn default_threshold_angle() -> f64 {
    10.0
}
fn default_speed_factor() -> f64 {
    1.0
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            steps_per_mm: default_steps_per_mm(),
            max_feedrate: default_max_feedrate(),
            acceleration: default_acceleration(),
            move_range_mm: Vec::new(),
            axis_mapping: default_axis_mapping(),
            endswitch_polarity: String::new(),
            min_endswitch: String::new(),
            max_endswitch: String::new(),
            home_order: default_home_order(),
            require_homing: false,
            range_check: true,
            synchronous: false,
            threshold_angle: default_threshold_angle(),
            speed_factor: default_speed_factor(),
        }
    }
}

impl MachineConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: MachineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the plain numeric constraints. Cross-field checks (mapping
    /// strings, endstop plausibility) happen when the machine control is
    /// constructed, since they need the derived tables.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for axis in Axis::ALL {
            let feedrate = self.max_feedrate(axis);
            if feedrate < 0.0 {
                return Err(ConfigError::NegativeFeedrate {
                    axis: axis.letter(),
                    feedrate,
                });
            }
            let accel = self.acceleration(axis);
            if accel < 0.0 {
                return Err(ConfigError::NegativeAcceleration {
                    axis: axis.letter(),
                    accel,
                });
            }
        }
        Ok(())
    }

    /// Signed steps/mm for `axis`; zero when unconfigured.
    pub fn steps_per_mm(&self, axis: Axis) -> f64 {
        axis_value(&self.steps_per_mm, axis)
    }

    pub fn max_feedrate(&self, axis: Axis) -> f64 {
        axis_value(&self.max_feedrate, axis)
    }

    pub fn acceleration(&self, axis: Axis) -> f64 {
        axis_value(&self.acceleration, axis)
    }

    pub fn move_range_mm(&self, axis: Axis) -> f64 {
        axis_value(&self.move_range_mm, axis)
    }
}

fn axis_value(values: &[f64], axis: Axis) -> f64 {
    values.get(axis.index()).copied().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_matches_builtin_table() {
        let config = MachineConfig::default();
        assert_eq!(config.steps_per_mm(Axis::X), 160.0);
        assert_eq!(config.steps_per_mm(Axis::E), 40.0);
        assert_eq!(config.max_feedrate(Axis::Z), 90.0);
        assert_eq!(config.acceleration(Axis::E), 10000.0);
        assert_eq!(config.axis_mapping, "XYZEA");
        assert_eq!(config.home_order, "ZXY");
        assert_eq!(config.threshold_angle, 10.0);
        assert!(config.range_check);
        assert!(!config.require_homing);
        assert!(!config.synchronous);
    }

    #[test]
    fn unconfigured_axes_read_as_zero() {
        let config = MachineConfig::default();
        assert_eq!(config.steps_per_mm(Axis::W), 0.0);
        assert_eq!(config.move_range_mm(Axis::X), 0.0);
    }

    #[test]
    fn parse_toml_config() {
        let toml_config = r#"
steps_per_mm = [160.0, 160.0, 160.0, 40.0]
max_feedrate = [200.0, 200.0, 90.0, 10.0]
acceleration = [4000.0, 4000.0, 1000.0, 10000.0]
move_range_mm = [100.0, 100.0, 30.0]
axis_mapping = "XYZE"
min_endswitch = "XYZ"
endswitch_polarity = "HHH"
home_order = "ZXY"
require_homing = true
threshold_angle = 12.5
"#;
        let config = MachineConfig::from_toml_str(toml_config).unwrap();
        assert_eq!(config.move_range_mm(Axis::Z), 30.0);
        assert_eq!(config.min_endswitch, "XYZ");
        assert!(config.require_homing);
        assert_eq!(config.threshold_angle, 12.5);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = MachineConfig::from_toml_str("").unwrap();
        assert_eq!(config.steps_per_mm(Axis::X), 160.0);
        assert_eq!(config.axis_mapping, "XYZEA");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "axis_mapping = \"XY\"").unwrap();
        writeln!(file, "synchronous = true").unwrap();
        let config = MachineConfig::load(file.path()).unwrap();
        assert_eq!(config.axis_mapping, "XY");
        assert!(config.synchronous);
    }

    #[test]
    fn negative_feedrate_rejected() {
        let mut config = MachineConfig::default();
        config.max_feedrate[1] = -10.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NegativeFeedrate { axis: 'Y', .. })
        ));
    }

    #[test]
    fn negative_acceleration_rejected() {
        let mut config = MachineConfig::default();
        config.acceleration[2] = -1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NegativeAcceleration { axis: 'Z', .. })
        ));
    }

    #[test]
    fn negative_steps_per_mm_is_legal() {
        let mut config = MachineConfig::default();
        config.steps_per_mm[0] = -160.0;
        assert!(config.validate().is_ok());
    }
}
