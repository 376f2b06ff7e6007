// src/motor.rs - Motor segment commands and axis-to-driver fan-out

use crate::axis::{Axis, NUM_AXES};
use crate::config::{ConfigError, MachineConfig};

/// Number of physical motor driver connectors.
pub const NUM_MOTORS: usize = 8;

/// Bitmap of driver connectors. One bit per physical driver.
pub type DriverBitmap = u8;

/// One timed step segment handed to the downstream step-pulse generator.
///
/// `v0` and `v1` are the start and end step frequencies along the defining
/// axis of the move this segment came from; the pulse generator interpolates
/// between them. `steps` carries the signed step count per physical driver.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotorMovement {
    pub steps: [i32; NUM_MOTORS],
    pub v0: f64,
    pub v1: f64,
    /// Auxiliary output mask latched when this segment starts executing.
    pub aux_bits: u16,
}

impl MotorMovement {
    /// True if any driver has a nonzero step count.
    pub fn has_steps(&self) -> bool {
        self.steps.iter().any(|&s| s != 0)
    }
}

/// The queue of the external step-pulse generator.
///
/// The generator runs on separate hardware; this trait is the only thing the
/// core knows about it. `enqueue` may block when the queue is full.
pub trait MotorOps {
    fn enqueue(&mut self, movement: MotorMovement);

    /// Block until every queued segment has been executed.
    fn drain(&mut self);

    fn motor_enable(&mut self, enable: bool);
}

/// Maps logical axis step counts onto physical drivers.
///
/// One axis may drive several connectors in lock-step (mirroring), and both
/// the axis (from a negative steps/mm) and the individual driver (from a
/// lowercase mapping letter) can flip direction.
#[derive(Debug, Clone)]
pub struct MotorMap {
    axis_to_driver: [DriverBitmap; NUM_AXES],
    axis_flip: [i32; NUM_AXES],
    driver_flip: [i32; NUM_MOTORS],
}

impl MotorMap {
    /// Derive the fan-out tables from the configured mapping string and the
    /// signs of the per-axis steps/mm values.
    pub fn from_config(cfg: &MachineConfig) -> Result<Self, ConfigError> {
        let mut map = MotorMap {
            axis_to_driver: [0; NUM_AXES],
            axis_flip: [1; NUM_AXES],
            driver_flip: [1; NUM_MOTORS],
        };

        for axis in Axis::ALL {
            if cfg.steps_per_mm(axis) < 0.0 {
                map.axis_flip[axis.index()] = -1;
            }
        }

        for (connector, ch) in cfg.axis_mapping.chars().enumerate() {
            if connector >= NUM_MOTORS {
                return Err(ConfigError::MappingTooLong {
                    mapping: cfg.axis_mapping.clone(),
                    max: NUM_MOTORS,
                });
            }
            if ch == '_' {
                continue;
            }
            let axis = Axis::from_letter(ch).ok_or_else(|| ConfigError::BadMappingChar {
                ch,
                mapping: cfg.axis_mapping.clone(),
            })?;
            map.driver_flip[connector] = if ch.is_ascii_lowercase() { -1 } else { 1 };
            map.axis_to_driver[axis.index()] |= 1 << connector;
        }

        Ok(map)
    }

    /// Assign `steps` for `axis` to every driver tracking that axis,
    /// applying both flips. Drivers not covered by the axis are untouched.
    pub fn assign_steps(&self, command: &mut MotorMovement, axis: Axis, steps: i32) {
        let drivers = self.axis_to_driver[axis.index()];
        for motor in 0..NUM_MOTORS {
            if drivers & (1 << motor) != 0 {
                command.steps[motor] = self.axis_flip[axis.index()] * self.driver_flip[motor] * steps;
            }
        }
    }

    /// The driver connectors tracking `axis`.
    pub fn drivers_for(&self, axis: Axis) -> DriverBitmap {
        self.axis_to_driver[axis.index()]
    }
}

/// Subtract `other`'s per-driver steps from `value` in place.
/// Returns true if any driver still has steps afterwards.
pub fn subtract_steps(value: &mut MotorMovement, other: &MotorMovement) -> bool {
    let mut has_nonzero = false;
    for motor in 0..NUM_MOTORS {
        value.steps[motor] -= other.steps[motor];
        has_nonzero |= value.steps[motor] != 0;
    }
    has_nonzero
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_mapping(mapping: &str) -> MachineConfig {
        MachineConfig {
            axis_mapping: mapping.to_string(),
            ..MachineConfig::default()
        }
    }

    #[test]
    fn simple_mapping() {
        let map = MotorMap::from_config(&config_with_mapping("XYZEA")).unwrap();
        assert_eq!(map.drivers_for(Axis::X), 1 << 0);
        assert_eq!(map.drivers_for(Axis::Z), 1 << 2);
        assert_eq!(map.drivers_for(Axis::A), 1 << 4);
        assert_eq!(map.drivers_for(Axis::B), 0);
    }

    #[test]
    fn mirrored_axis_drives_both_connectors() {
        let map = MotorMap::from_config(&config_with_mapping("XYZX")).unwrap();
        assert_eq!(map.drivers_for(Axis::X), (1 << 0) | (1 << 3));

        let mut command = MotorMovement::default();
        map.assign_steps(&mut command, Axis::X, 100);
        assert_eq!(command.steps[0], 100);
        assert_eq!(command.steps[3], 100);
        assert_eq!(command.steps[1], 0);
    }

    #[test]
    fn lowercase_letter_flips_driver() {
        let map = MotorMap::from_config(&config_with_mapping("Xx")).unwrap();
        let mut command = MotorMovement::default();
        map.assign_steps(&mut command, Axis::X, 10);
        assert_eq!(command.steps[0], 10);
        assert_eq!(command.steps[1], -10);
    }

    #[test]
    fn negative_steps_per_mm_flips_axis() {
        let mut cfg = config_with_mapping("XY");
        cfg.steps_per_mm[0] = -160.0;
        let map = MotorMap::from_config(&cfg).unwrap();
        let mut command = MotorMovement::default();
        map.assign_steps(&mut command, Axis::X, 10);
        map.assign_steps(&mut command, Axis::Y, 10);
        assert_eq!(command.steps[0], -10);
        assert_eq!(command.steps[1], 10);
    }

    #[test]
    fn underscore_skips_connector() {
        let map = MotorMap::from_config(&config_with_mapping("X_Y")).unwrap();
        assert_eq!(map.drivers_for(Axis::Y), 1 << 2);
    }

    #[test]
    fn rejects_bad_mapping_character() {
        assert!(matches!(
            MotorMap::from_config(&config_with_mapping("XQ")),
            Err(ConfigError::BadMappingChar { ch: 'Q', .. })
        ));
    }

    #[test]
    fn rejects_oversized_mapping() {
        assert!(matches!(
            MotorMap::from_config(&config_with_mapping("XYZEABCUV")),
            Err(ConfigError::MappingTooLong { .. })
        ));
    }

    #[test]
    fn subtract_reports_remaining_steps() {
        let mut value = MotorMovement {
            steps: [10, 0, 0, 0, 0, 0, 0, 0],
            ..MotorMovement::default()
        };
        let other = MotorMovement {
            steps: [4, 0, 0, 0, 0, 0, 0, 0],
            ..MotorMovement::default()
        };
        assert!(subtract_steps(&mut value, &other));
        assert_eq!(value.steps[0], 6);

        let rest = MotorMovement {
            steps: [6, 0, 0, 0, 0, 0, 0, 0],
            ..MotorMovement::default()
        };
        assert!(!subtract_steps(&mut value, &rest));
    }
}
