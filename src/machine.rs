// src/machine.rs - The machine control state machine driven by parser events

use std::io::Write;
use std::thread;
use std::time::Duration;

use crate::axis::{axis_bit, AxesRegister, Axis, AxisBitmap, NUM_AXES};
use crate::config::{ConfigError, MachineConfig};
use crate::gcode::{parse_pair, GCodeEvents};
use crate::hardware::{Gpio, GpioPin, Pwm};
use crate::motion::{Planner, PlanningBuffer};
use crate::motor::{MotorMap, MotorMovement, MotorOps};

const VERSION_STRING: &str =
    "PROTOCOL_VERSION:0.1 FIRMWARE_NAME:Gantry FIRMWARE_URL:http%3A//github.com/gantry-cnc/gantry";

// aux_bits
pub const AUX_BIT_MIST: u16 = 1 << 0;
pub const AUX_BIT_FLOOD: u16 = 1 << 1;
pub const AUX_BIT_VACUUM: u16 = 1 << 2;
pub const AUX_BIT_SPINDLE_ON: u16 = 1 << 3;
pub const AUX_BIT_SPINDLE_DIR: u16 = 1 << 4;
const MAX_AUX_PIN: i32 = 15;

const NUM_ENDSTOPS: usize = 6;

/// Endstops are approached slowly; the trigger point is not predictable.
const HOMING_FEEDRATE_MM_S: f64 = 15.0;
const PROBE_FEEDRATE_FALLBACK_MM_S: f64 = 20.0;

/// How one endstop switch is wired up and used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndstopConfig {
    /// Switch connector, 1..=NUM_ENDSTOPS; 0 means not mapped.
    pub endstop_number: u8,
    /// GPIO level that means "triggered".
    pub trigger_value: bool,
    /// Whether this switch defines the axis's home origin.
    pub homing_use: bool,
}

/// The three levels of homing confidence. Once motor power has been off,
/// the position can no longer be trusted completely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HomingState {
    NeverHomed,
    HomedButMotorsUnpowered,
    Homed,
}

/// The machine control core.
///
/// A state machine driven by the events coming out of the toolpath parser;
/// it implements the event receiver interface directly. Incoming targets
/// flow through the planning buffer into the segmenter and out to the motor
/// queue `M`; auxiliary outputs and endstops live behind the hardware
/// interface `H`.
pub struct MachineControl<M, H> {
    /// Normalised configuration: steps/mm magnitudes, signs extracted.
    cfg: MachineConfig,
    motor_ops: M,
    hardware: H,
    msg_stream: Option<Box<dyn Write>>,

    // Derived configuration.
    /// Highest of all axes; used for rapid moves without a usable feed.
    g0_feedrate_mm_per_sec: f64,
    /// Per-axis speed ceiling, steps/s.
    max_axis_speed: [f64; NUM_AXES],
    motor_map: MotorMap,
    planner: Planner,
    min_endstop: [EndstopConfig; NUM_AXES],
    max_endstop: [EndstopConfig; NUM_AXES],

    // Current machine state.
    coordinate_display_origin: AxesRegister,
    /// Set via Fxxx and remembered.
    current_feedrate_mm_per_sec: f64,
    /// Speed factor set by the program (M220).
    prog_speed_factor: f64,
    aux_bits: u16,
    /// Set via Sxxx of M3/M4 and remembered.
    spindle_rpm: u32,

    /// Next buffered positions. Written by incoming targets, read by
    /// outgoing motor movements.
    planning_buffer: PlanningBuffer,
    homing_state: HomingState,
}

fn euclid_distance(x: f64, y: f64, z: f64) -> f64 {
    (x * x + y * y + z * z).sqrt()
}

fn parse_polarity(polarity: &str) -> Result<[bool; NUM_ENDSTOPS], ConfigError> {
    let mut triggers = [false; NUM_ENDSTOPS];
    for (connector, ch) in polarity.chars().enumerate() {
        if connector >= NUM_ENDSTOPS {
            return Err(ConfigError::EndstopMappingTooLong {
                mapping: polarity.to_string(),
                max: NUM_ENDSTOPS,
            });
        }
        triggers[connector] = match ch {
            '_' | '0' | '-' | 'L' => false,
            '1' | '+' | 'H' => true,
            _ => {
                return Err(ConfigError::BadPolarityChar {
                    ch,
                    polarity: polarity.to_string(),
                })
            }
        };
    }
    Ok(triggers)
}

fn parse_endswitch_mapping(
    mapping: &str,
    triggers: &[bool; NUM_ENDSTOPS],
) -> Result<[EndstopConfig; NUM_AXES], ConfigError> {
    let mut endstops = [EndstopConfig::default(); NUM_AXES];
    for (connector, ch) in mapping.chars().enumerate() {
        if connector >= NUM_ENDSTOPS {
            return Err(ConfigError::EndstopMappingTooLong {
                mapping: mapping.to_string(),
                max: NUM_ENDSTOPS,
            });
        }
        if ch == '_' {
            continue;
        }
        let axis = Axis::from_letter(ch).ok_or_else(|| ConfigError::BadEndstopChar {
            ch,
            mapping: mapping.to_string(),
        })?;
        endstops[axis.index()] = EndstopConfig {
            endstop_number: (connector + 1) as u8,
            trigger_value: triggers[connector],
            homing_use: ch.is_ascii_uppercase(),
        };
    }
    Ok(endstops)
}

impl<M: MotorOps, H: Gpio + Pwm> MachineControl<M, H> {
    /// Validate the configuration, derive the step-domain tables, and seed
    /// the planning buffer with the boot-time pose. Fails on any implausible
    /// configuration.
    pub fn new(config: MachineConfig, motor_ops: M, hardware: H) -> Result<Self, ConfigError> {
        config.validate()?;

        let motor_map = MotorMap::from_config(&config)?;

        // Keep steps/mm positive everywhere past this point; the direction
        // sign has been extracted into the motor map.
        let mut cfg = config;
        for value in &mut cfg.steps_per_mm {
            *value = value.abs();
        }

        let mut g0_feedrate = 0.0f64;
        let mut max_axis_speed = [0.0; NUM_AXES];
        let mut max_axis_accel = [0.0; NUM_AXES];
        let mut steps_per_mm = [0.0; NUM_AXES];
        for axis in Axis::ALL {
            let i = axis.index();
            if cfg.max_feedrate(axis) > g0_feedrate {
                g0_feedrate = cfg.max_feedrate(axis);
            }
            steps_per_mm[i] = cfg.steps_per_mm(axis);
            max_axis_speed[i] = cfg.max_feedrate(axis) * steps_per_mm[i];
            max_axis_accel[i] = cfg.acceleration(axis) * steps_per_mm[i];
        }

        let triggers = parse_polarity(&cfg.endswitch_polarity)?;
        let min_endstop = parse_endswitch_mapping(&cfg.min_endswitch, &triggers)?;
        let max_endstop = parse_endswitch_mapping(&cfg.max_endswitch, &triggers)?;

        for axis in Axis::ALL {
            let i = axis.index();
            // A max-endstop implies we must know where it is.
            if max_endstop[i].endstop_number != 0 && cfg.move_range_mm(axis) <= 0.0 {
                return Err(ConfigError::MaxEndstopWithoutRange {
                    axis: axis.letter(),
                });
            }
            // Only one home origin per axis.
            if min_endstop[i].endstop_number != 0
                && max_endstop[i].endstop_number != 0
                && min_endstop[i].homing_use
                && max_endstop[i].homing_use
            {
                return Err(ConfigError::TwoHomeEndstops {
                    axis: axis.letter(),
                });
            }
        }

        // Every axis wired to a driver needs usable rates.
        for axis in Axis::ALL {
            if motor_map.drivers_for(axis) == 0 {
                continue;
            }
            if cfg.steps_per_mm(axis) <= 0.0 || cfg.max_feedrate(axis) <= 0.0 {
                return Err(ConfigError::UnusableAxis {
                    axis: axis.letter(),
                });
            }
            tracing::debug!(
                axis = %axis.letter(),
                feedrate_mm_s = cfg.max_feedrate(axis),
                accel_mm_s2 = cfg.acceleration(axis),
                steps_per_mm = cfg.steps_per_mm(axis),
                range_mm = cfg.move_range_mm(axis),
                range_check = cfg.range_check,
                "axis configuration"
            );
        }

        let planner = Planner::new(
            max_axis_accel,
            steps_per_mm,
            cfg.threshold_angle,
            cfg.synchronous,
            motor_map.clone(),
        );

        let current_feedrate = cfg.max_feedrate(Axis::X) / 10.0;

        let mut control = MachineControl {
            cfg,
            motor_ops,
            hardware,
            msg_stream: None,
            g0_feedrate_mm_per_sec: g0_feedrate,
            max_axis_speed,
            motor_map,
            planner,
            min_endstop,
            max_endstop,
            coordinate_display_origin: AxesRegister::new(),
            current_feedrate_mm_per_sec: current_feedrate,
            prog_speed_factor: 1.0,
            aux_bits: 0,
            spindle_rpm: 0,
            planning_buffer: PlanningBuffer::new(),
            homing_state: HomingState::NeverHomed,
        };

        // Initial machine position: the homed position, which is wherever
        // the home endswitch sits for each axis; origin otherwise.
        let home = control.home_position();
        let init = control.planning_buffer.append();
        for axis in Axis::ALL {
            init.position_steps[axis.index()] =
                (home[axis] * control.cfg.steps_per_mm(axis)).round() as i32;
        }

        Ok(control)
    }

    /// Route parser-visible output somewhere, or nowhere.
    pub fn set_msg_stream(&mut self, stream: Option<Box<dyn Write>>) {
        self.msg_stream = stream;
    }

    pub fn homing_state(&self) -> HomingState {
        self.homing_state
    }

    pub fn aux_bits(&self) -> u16 {
        self.aux_bits
    }

    pub fn planning_buffer_len(&self) -> usize {
        self.planning_buffer.len()
    }

    pub fn motor_ops(&self) -> &M {
        &self.motor_ops
    }

    /// The endstop-implied home pose in mm; zero for axes without a home
    /// switch.
    pub fn home_position(&self) -> AxesRegister {
        let mut home = AxesRegister::new();
        for axis in Axis::ALL {
            if let Some((dir, _)) = self.home_endstop(axis) {
                home[axis] = if dir < 0 {
                    0.0
                } else {
                    self.cfg.move_range_mm(axis)
                };
            }
        }
        home
    }

    // Machine-printf; only prints when a message stream is attached.
    fn mprint(&mut self, args: std::fmt::Arguments) {
        if let Some(stream) = self.msg_stream.as_mut() {
            let _ = stream.write_fmt(args);
        }
    }

    /// The endstop used to home `axis`, with the approach direction, or
    /// None when the axis has no switch flagged for homing.
    fn home_endstop(&self, axis: Axis) -> Option<(i32, EndstopConfig)> {
        let mut dir = 1;
        let mut config = self.max_endstop[axis.index()];
        let min = self.min_endstop[axis.index()];
        if min.endstop_number != 0 && min.homing_use {
            dir = -1;
            config = min;
        }
        if config.endstop_number == 0 || !config.homing_use {
            return None;
        }
        Some((dir, config))
    }

    /// If we have enough data in the queue, issue the next motor move.
    fn issue_motor_move_if_possible(&mut self) {
        if self.planning_buffer.len() >= 3 {
            let last = *self.planning_buffer.peek(0); // established position
            let upcoming = *self.planning_buffer.peek(2); // next after that
            let target = self.planning_buffer.peek_mut(1); // what we move now
            self.planner
                .move_machine_steps(&last, target, &upcoming, &mut self.motor_ops);
            self.planning_buffer.pop_front();
        }
    }

    fn machine_move(&mut self, feedrate: f64, axes: &AxesRegister) {
        // We always have a previous position.
        let previous = *self.planning_buffer.back();

        // Real world -> machine coordinates. Rounding to the next full step
        // here never accumulates: the absolute position is the reference.
        let mut position_steps = [0i32; NUM_AXES];
        let mut delta_steps = [0i32; NUM_AXES];
        let mut max_steps = 0i32;
        let mut defining_axis = Axis::X;
        for axis in Axis::ALL {
            let i = axis.index();
            position_steps[i] = (axes[axis] * self.cfg.steps_per_mm(axis)).round() as i32;
            delta_steps[i] = position_steps[i] - previous.position_steps[i];

            // The defining axis has to travel the most steps; it defines the
            // frequency, all other axes run a fraction of it.
            if delta_steps[i].abs() > max_steps {
                max_steps = delta_steps[i].abs();
                defining_axis = axis;
            }
        }

        // Default angle forces a speed change at the junction.
        let mut angle = previous.angle + 180.0;
        let speed = if max_steps > 0 {
            let mut travel_speed = feedrate * self.cfg.steps_per_mm(defining_axis);

            // In Euclidean space, scale the step frequency to the relative
            // feedrate of the defining axis: a straight 200mm/s should be
            // the same as a diagonal 200mm/s.
            if defining_axis.is_cartesian() {
                let x = delta_steps[Axis::X.index()] as f64 / self.cfg.steps_per_mm(Axis::X);
                let y = delta_steps[Axis::Y.index()] as f64 / self.cfg.steps_per_mm(Axis::Y);
                let z = delta_steps[Axis::Z.index()] as f64 / self.cfg.steps_per_mm(Axis::Z);
                let total_xyz_len_mm = euclid_distance(x, y, z);
                let defining_len_mm = delta_steps[defining_axis.index()] as f64
                    / self.cfg.steps_per_mm(defining_axis);
                travel_speed *= defining_len_mm.abs() / total_xyz_len_mm;

                // A true XY vector gets its heading for corner detection.
                if z == 0.0 {
                    angle = y.atan2(x).to_degrees();
                }
            }

            if travel_speed > self.max_axis_speed[defining_axis.index()] {
                travel_speed = self.max_axis_speed[defining_axis.index()];
            }
            // The slower axes riding along must stay under their own
            // ceilings too.
            for axis in Axis::ALL {
                let i = axis.index();
                if axis == defining_axis || delta_steps[i] == 0 || self.max_axis_speed[i] <= 0.0 {
                    continue;
                }
                let axis_speed = travel_speed * delta_steps[i].abs() as f64 / max_steps as f64;
                if axis_speed > self.max_axis_speed[i] {
                    travel_speed = self.max_axis_speed[i] * max_steps as f64
                        / delta_steps[i].abs() as f64;
                }
            }
            travel_speed
        } else {
            0.0
        };

        let aux_bits = self.aux_bits;
        let new_pos = self.planning_buffer.append();
        new_pos.position_steps = position_steps;
        new_pos.delta_steps = delta_steps;
        new_pos.defining_axis = defining_axis;
        new_pos.angle = angle;
        new_pos.aux_bits = aux_bits;
        new_pos.speed = speed;

        self.issue_motor_move_if_possible();
    }

    /// Enqueue a target at the previous position with zero speed, so the
    /// preceding segment decelerates to a stop. The only way the tail of a
    /// program ever slows down.
    fn bring_path_to_halt(&mut self) {
        let previous = *self.planning_buffer.back();
        let aux_bits = self.aux_bits;
        let new_pos = self.planning_buffer.append();
        new_pos.position_steps = previous.position_steps;
        new_pos.defining_axis = Axis::X;
        new_pos.speed = 0.0;
        // Not an XY vector; the sentinel angle forces the preceding move to
        // treat this junction as a sharp corner and decelerate into it.
        new_pos.angle = previous.angle + 180.0;
        new_pos.aux_bits = aux_bits;
        self.issue_motor_move_if_possible();
    }

    fn test_homing_status_ok(&mut self) -> bool {
        if !self.cfg.require_homing {
            return true;
        }
        if self.homing_state > HomingState::NeverHomed {
            return true;
        }
        tracing::warn!("move refused: machine not homed");
        self.mprint(format_args!("// ERROR: please home machine first (G28).\n"));
        false
    }

    fn test_within_machine_limits(&mut self, axes: &AxesRegister) -> bool {
        if !self.cfg.range_check {
            return true;
        }
        for axis in Axis::ALL {
            // The machine cube is all-positive.
            if axes[axis] < 0.0 {
                tracing::warn!(axis = %axis.letter(), target_mm = axes[axis], "move outside machine limits refused");
                let origin = self.coordinate_display_origin[axis];
                if origin != 0.0 {
                    self.mprint(format_args!(
                        "// ERROR outside machine limit: Axis {} < min allowed {:+.1}mm in current coordinate system. Ignoring move!\n",
                        axis.letter(), -origin
                    ));
                } else {
                    self.mprint(format_args!(
                        "// ERROR outside machine limit: Axis {} < 0. Ignoring move!\n",
                        axis.letter()
                    ));
                }
                return false;
            }

            let max_limit = self.cfg.move_range_mm(axis);
            if max_limit <= 0.0 {
                continue; // max range not configured.
            }
            if axes[axis] > max_limit {
                tracing::warn!(axis = %axis.letter(), target_mm = axes[axis], max_limit, "move outside machine limits refused");
                let origin = self.coordinate_display_origin[axis];
                if origin != 0.0 {
                    self.mprint(format_args!(
                        "// ERROR outside machine limit: Axis {} > max allowed {:+.1}mm in current coordinate system (={:.1}mm machine absolute). Ignoring move!\n",
                        axis.letter(), max_limit - origin, max_limit
                    ));
                } else {
                    self.mprint(format_args!(
                        "// ERROR outside machine limit: Axis {} > {:.1}mm. Ignoring move!\n",
                        axis.letter(),
                        max_limit
                    ));
                }
                return false;
            }
        }
        true
    }

    /// Moves toward the endstop in small uni-directional segments, draining
    /// between each so the switch can be polled; the trigger point is not
    /// predictable, which is why homing bypasses the lookahead entirely.
    /// Returns how many steps were moved in the process.
    fn move_to_endstop(
        &mut self,
        axis: Axis,
        feedrate: f64,
        backoff: bool,
        dir: i32,
        trigger_value: bool,
        pin: GpioPin,
    ) -> i32 {
        let mut total_movement = 0;
        let steps_per_mm = self.cfg.steps_per_mm(axis);
        let mut target_speed = feedrate * steps_per_mm;
        if target_speed > self.max_axis_speed[axis.index()] {
            target_speed = self.max_axis_speed[axis.index()];
        }

        let mut move_command = MotorMovement {
            v0: 0.0,
            v1: target_speed,
            ..MotorMovement::default()
        };

        // Move until the endstop is hit, accelerating across segments by
        // carrying v1 into the next v0.
        let mut segment_move_steps = (0.5 * steps_per_mm) as i32 * dir;
        self.motor_map
            .assign_steps(&mut move_command, axis, segment_move_steps);
        while self.hardware.read(pin) != trigger_value {
            self.motor_ops.enqueue(move_command);
            self.motor_ops.drain();
            total_movement += segment_move_steps;
            move_command.v0 = move_command.v1;
        }

        if backoff {
            // Move off the switch again, slowly.
            segment_move_steps = (0.1 * steps_per_mm) as i32 * -dir;
            self.motor_map
                .assign_steps(&mut move_command, axis, segment_move_steps);
            while self.hardware.read(pin) == trigger_value {
                self.motor_ops.enqueue(move_command);
                self.motor_ops.drain();
                total_movement += segment_move_steps;
            }
        }

        total_movement
    }

    fn home_axis(&mut self, axis: Axis) {
        let Some((dir, endstop)) = self.home_endstop(axis) else {
            return;
        };
        let pin = GpioPin::Endstop(endstop.endstop_number);
        self.move_to_endstop(
            axis,
            HOMING_FEEDRATE_MM_S,
            true,
            dir,
            endstop.trigger_value,
            pin,
        );
        let home_pos = if dir < 0 {
            0.0
        } else {
            self.cfg.move_range_mm(axis)
        };
        let steps = (home_pos * self.cfg.steps_per_mm(axis)).round() as i32;
        self.planning_buffer.back().position_steps[axis.index()] = steps;
    }

    fn report_position(&mut self) {
        let current = *self.planning_buffer.peek(0);
        let x = current.position_steps[Axis::X.index()] as f64 / self.cfg.steps_per_mm(Axis::X);
        let y = current.position_steps[Axis::Y.index()] as f64 / self.cfg.steps_per_mm(Axis::Y);
        let z = current.position_steps[Axis::Z.index()] as f64 / self.cfg.steps_per_mm(Axis::Z);
        let e = current.position_steps[Axis::E.index()] as f64 / self.cfg.steps_per_mm(Axis::E);
        let origin = self.coordinate_display_origin;
        self.mprint(format_args!(
            "X:{:.3} Y:{:.3} Z:{:.3} E:{:.3}",
            x - origin[Axis::X],
            y - origin[Axis::Y],
            z - origin[Axis::Z],
            e - origin[Axis::E]
        ));
        self.mprint(format_args!(
            " [ABS. MACHINE CUBE X:{:.3} Y:{:.3} Z:{:.3}]",
            x, y, z
        ));
        match self.homing_state {
            HomingState::NeverHomed => {
                self.mprint(format_args!(" (Unsure: machine never homed!)\n"));
            }
            HomingState::HomedButMotorsUnpowered => {
                self.mprint(format_args!(
                    " (Lower confidence: motor power off at least once after homing)\n"
                ));
            }
            HomingState::Homed => {
                self.mprint(format_args!(" (confident: machine was homed)\n"));
            }
        }
    }

    fn report_endstop_status(&mut self) {
        let min_endstop = self.min_endstop;
        let max_endstop = self.max_endstop;
        let mut any_endstops_found = false;
        for axis in Axis::ALL {
            for (config, kind) in [
                (min_endstop[axis.index()], "min"),
                (max_endstop[axis.index()], "max"),
            ] {
                if config.endstop_number == 0 {
                    continue;
                }
                let value = self.hardware.read(GpioPin::Endstop(config.endstop_number));
                self.mprint(format_args!(
                    "{}_{}:{} ",
                    axis.letter().to_ascii_lowercase(),
                    kind,
                    if value == config.trigger_value {
                        "TRIGGERED"
                    } else {
                        "open"
                    }
                ));
                any_endstops_found = true;
            }
        }
        if any_endstops_found {
            self.mprint(format_args!("\n"));
        } else {
            self.mprint(format_args!(
                "// This machine has no endstops configured.\n"
            ));
        }
    }

    fn special_commands<'a>(
        &mut self,
        letter: char,
        value: f64,
        mut remaining: &'a str,
    ) -> Option<&'a str> {
        if letter != 'M' {
            return Some(remaining);
        }
        let code = value as i32;
        match code {
            0 => self.hardware.set(GpioPin::EstopSwitch, true),
            999 => self.hardware.set(GpioPin::EstopSwitch, false),
            3 | 4 => {
                while let Some(('S', rpm, rest)) = parse_pair(remaining) {
                    self.spindle_rpm = rpm.round().max(0.0) as u32;
                    remaining = rest;
                }
                if self.spindle_rpm != 0 {
                    self.aux_bits |= AUX_BIT_SPINDLE_ON;
                    if code == 3 {
                        self.aux_bits &= !AUX_BIT_SPINDLE_DIR;
                    } else {
                        self.aux_bits |= AUX_BIT_SPINDLE_DIR;
                    }
                }
            }
            5 => self.aux_bits &= !(AUX_BIT_SPINDLE_ON | AUX_BIT_SPINDLE_DIR),
            7 => self.aux_bits |= AUX_BIT_MIST,
            8 => self.aux_bits |= AUX_BIT_FLOOD,
            9 => self.aux_bits &= !(AUX_BIT_MIST | AUX_BIT_FLOOD),
            10 => self.aux_bits |= AUX_BIT_VACUUM,
            11 => self.aux_bits &= !AUX_BIT_VACUUM,
            17 => self.motors_enable(true),
            18 | 84 => self.motors_enable(false),
            42 | 62 | 63 | 64 | 65 => {
                let mut pin: i32 = -1;
                let mut aux_bit: i32 = -1;
                loop {
                    match parse_pair(remaining) {
                        Some(('P', v, rest)) => {
                            pin = v.round() as i32;
                            remaining = rest;
                        }
                        Some(('S', v, rest)) if code == 42 => {
                            aux_bit = v.round() as i32;
                            remaining = rest;
                        }
                        _ => break,
                    }
                }
                if code == 62 || code == 64 {
                    aux_bit = 1;
                } else if code == 63 || code == 65 {
                    aux_bit = 0;
                }
                if (0..=MAX_AUX_PIN).contains(&pin) {
                    if (0..=1).contains(&aux_bit) {
                        if aux_bit == 1 {
                            self.aux_bits |= 1 << pin;
                        } else {
                            self.aux_bits &= !(1 << pin);
                        }
                        if code == 64 || code == 65 {
                            // Update the pin now, without waiting for motion.
                            self.hardware.set(GpioPin::Aux(pin as u8), aux_bit == 1);
                        }
                    } else if code == 42 {
                        // Just a read operation.
                        let state = (self.aux_bits >> pin) & 1;
                        self.mprint(format_args!("{}\n", state));
                    }
                }
            }
            80 => self.hardware.set(GpioPin::MachinePower, true),
            81 => self.hardware.set(GpioPin::MachinePower, false),
            105 => self.mprint(format_args!("T-300\n")), // no temperature sensing.
            114 => self.report_position(),
            115 => self.mprint(format_args!("{}\n", VERSION_STRING)),
            117 => {
                self.mprint(format_args!("// Msg: {}\n", remaining.trim_start()));
                return None; // consume the full line.
            }
            119 => self.report_endstop_status(),
            _ => {
                tracing::info!(letter = %letter, code, "unsupported special command");
                self.mprint(format_args!(
                    "// Gantry: didn't understand ('{}', {}, '{}')\n",
                    letter, code, remaining
                ));
                return None; // discard the remaining block.
            }
        }
        Some(remaining)
    }
}

impl<M: MotorOps, H: Gpio + Pwm> GCodeEvents for MachineControl<M, H> {
    fn gcode_finished(&mut self) {
        self.bring_path_to_halt();
    }

    fn inform_origin_offset(&mut self, origin: &AxesRegister) {
        self.coordinate_display_origin = *origin;
    }

    fn gcode_command_done(&mut self, _letter: char, _value: f64) {
        self.mprint(format_args!("ok\n"));
    }

    fn input_idle(&mut self) {
        self.bring_path_to_halt();
    }

    fn wait_for_start(&mut self) {
        let flash = Duration::from_millis(100);
        while self.hardware.read(GpioPin::StartButton) {
            self.hardware.set(GpioPin::StatusLed, true);
            thread::sleep(flash);
            self.hardware.set(GpioPin::StatusLed, false);
            thread::sleep(flash);
        }
    }

    fn go_home(&mut self, axes: AxisBitmap) {
        self.bring_path_to_halt();
        let order = self.cfg.home_order.clone();
        for ch in order.chars() {
            let Some(axis) = Axis::from_letter(ch) else {
                continue;
            };
            if axes & axis_bit(axis) == 0 {
                continue;
            }
            self.home_axis(axis);
        }
        self.homing_state = HomingState::Homed;
    }

    fn probe_axis(&mut self, feed_mm_s: f64, axis: Axis) -> Option<f64> {
        if !self.test_homing_status_ok() {
            return None;
        }
        self.bring_path_to_halt();

        // Probing wants the switch that is _not_ used for homing.
        let mut dir = 1;
        let mut config = self.max_endstop[axis.index()];
        let min = self.min_endstop[axis.index()];
        if min.endstop_number != 0 && !min.homing_use {
            dir = -1;
            config = min;
        }
        if config.endstop_number == 0 || config.homing_use {
            self.mprint(format_args!(
                "// Gantry: No probe - axis {} does not have a travel endstop\n",
                axis.letter()
            ));
            return None;
        }

        let feedrate = if feed_mm_s <= 0.0 {
            PROBE_FEEDRATE_FALLBACK_MM_S
        } else {
            feed_mm_s
        };
        let pin = GpioPin::Endstop(config.endstop_number);
        let total_steps =
            self.move_to_endstop(axis, feedrate, false, dir, config.trigger_value, pin);
        let last = self.planning_buffer.back();
        last.position_steps[axis.index()] += total_steps;
        let probed = last.position_steps[axis.index()] as f64 / self.cfg.steps_per_mm(axis);
        Some(probed)
    }

    fn set_speed_factor(&mut self, factor: f64) {
        // M220 S-10 is interpreted as: 90%.
        let factor = if factor < 0.0 { 1.0 + factor } else { factor };
        if factor < 0.005 {
            tracing::warn!(factor, "speed factor below floor, ignored");
            self.mprint(format_args!(
                "// M220: Not accepting speed factors < 0.5% (got {:.1}%)\n",
                100.0 * factor
            ));
            return;
        }
        self.prog_speed_factor = factor;
    }

    fn set_fanspeed(&mut self, speed: f64) {
        if !(0.0..=255.0).contains(&speed) {
            return;
        }
        let duty_cycle = speed / 255.0;
        if duty_cycle == 0.0 {
            self.hardware.set(GpioPin::Fan, false);
            self.hardware.enable(GpioPin::Fan, false);
        } else {
            self.hardware.set(GpioPin::Fan, true);
            self.hardware.set_duty(GpioPin::Fan, duty_cycle);
            self.hardware.enable(GpioPin::Fan, true);
        }
    }

    fn set_temperature(&mut self, degrees_c: f64) {
        self.mprint(format_args!(
            "// Gantry: set_temperature({:.1}) not implemented.\n",
            degrees_c
        ));
    }

    fn wait_temperature(&mut self) {
        self.mprint(format_args!(
            "// Gantry: wait_temperature() not implemented.\n"
        ));
    }

    fn dwell(&mut self, time_ms: f64) {
        self.bring_path_to_halt();
        self.motor_ops.drain();
        thread::sleep(Duration::from_micros((time_ms * 1000.0).max(0.0) as u64));
    }

    fn motors_enable(&mut self, enable: bool) {
        self.bring_path_to_halt();
        self.motor_ops.motor_enable(enable);
        if !enable && self.homing_state == HomingState::Homed {
            self.homing_state = HomingState::HomedButMotorsUnpowered;
        }
    }

    fn coordinated_move(&mut self, feed_mm_s: f64, target: &AxesRegister) -> bool {
        if !self.test_homing_status_ok() {
            return false;
        }
        if !self.test_within_machine_limits(target) {
            return false;
        }
        if feed_mm_s > 0.0 {
            self.current_feedrate_mm_per_sec = self.cfg.speed_factor * feed_mm_s;
        }
        let feedrate = self.prog_speed_factor * self.current_feedrate_mm_per_sec;
        self.machine_move(feedrate, target);
        true
    }

    fn rapid_move(&mut self, feed_mm_s: f64, target: &AxesRegister) -> bool {
        if !self.test_homing_status_ok() {
            return false;
        }
        if !self.test_within_machine_limits(target) {
            return false;
        }
        let given = self.cfg.speed_factor * self.prog_speed_factor * feed_mm_s;
        let feedrate = if given > 0.0 {
            given
        } else {
            self.g0_feedrate_mm_per_sec
        };
        self.machine_move(feedrate, target);
        true
    }

    fn unprocessed<'a>(&mut self, letter: char, value: f64, remaining: &'a str) -> Option<&'a str> {
        self.special_commands(letter, value, remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::NullHardware;

    #[derive(Default)]
    struct VecMotors {
        queued: Vec<MotorMovement>,
        enabled: Option<bool>,
    }

    impl MotorOps for VecMotors {
        fn enqueue(&mut self, movement: MotorMovement) {
            self.queued.push(movement);
        }

        fn drain(&mut self) {}

        fn motor_enable(&mut self, enable: bool) {
            self.enabled = Some(enable);
        }
    }

    fn control(cfg: MachineConfig) -> MachineControl<VecMotors, NullHardware> {
        MachineControl::new(cfg, VecMotors::default(), NullHardware).unwrap()
    }

    #[test]
    fn construction_rejects_two_home_endstops() {
        let cfg = MachineConfig {
            min_endswitch: "X".to_string(),
            max_endswitch: "X".to_string(),
            move_range_mm: vec![100.0],
            ..MachineConfig::default()
        };
        let result = MachineControl::new(cfg, VecMotors::default(), NullHardware);
        assert!(matches!(
            result.err(),
            Some(ConfigError::TwoHomeEndstops { axis: 'X' })
        ));
    }

    #[test]
    fn construction_rejects_max_endstop_without_range() {
        let cfg = MachineConfig {
            max_endswitch: "Y".to_string(),
            ..MachineConfig::default()
        };
        let result = MachineControl::new(cfg, VecMotors::default(), NullHardware);
        assert!(matches!(
            result.err(),
            Some(ConfigError::MaxEndstopWithoutRange { axis: 'Y' })
        ));
    }

    #[test]
    fn construction_rejects_bad_polarity() {
        let cfg = MachineConfig {
            min_endswitch: "X".to_string(),
            endswitch_polarity: "Q".to_string(),
            ..MachineConfig::default()
        };
        let result = MachineControl::new(cfg, VecMotors::default(), NullHardware);
        assert!(matches!(
            result.err(),
            Some(ConfigError::BadPolarityChar { ch: 'Q', .. })
        ));
    }

    #[test]
    fn construction_rejects_driver_on_unconfigured_axis() {
        let cfg = MachineConfig {
            axis_mapping: "XYZEAB".to_string(), // B has no steps/mm
            ..MachineConfig::default()
        };
        let result = MachineControl::new(cfg, VecMotors::default(), NullHardware);
        assert!(matches!(
            result.err(),
            Some(ConfigError::UnusableAxis { axis: 'B' })
        ));
    }

    #[test]
    fn boot_pose_uses_max_endstop_position() {
        let cfg = MachineConfig {
            max_endswitch: "X".to_string(),
            move_range_mm: vec![100.0],
            ..MachineConfig::default()
        };
        let control = MachineControl::new(cfg, VecMotors::default(), NullHardware).unwrap();
        let home = control.home_position();
        assert_eq!(home[Axis::X], 100.0);
        assert_eq!(home[Axis::Y], 0.0);
    }

    #[test]
    fn speed_factor_floor_is_enforced() {
        let mut machine = control(MachineConfig::default());
        machine.set_speed_factor(0.001);
        assert_eq!(machine.prog_speed_factor, 1.0);
        machine.set_speed_factor(0.5);
        assert_eq!(machine.prog_speed_factor, 0.5);
        // Negative factors are relative: -0.10 means 90%.
        machine.set_speed_factor(-0.10);
        assert!((machine.prog_speed_factor - 0.90).abs() < 1e-12);
    }

    #[test]
    fn coolant_m_codes_update_aux_mask() {
        let mut machine = control(MachineConfig::default());
        assert_eq!(machine.unprocessed('M', 7.0, ""), Some(""));
        assert_eq!(machine.aux_bits() & AUX_BIT_MIST, AUX_BIT_MIST);
        machine.unprocessed('M', 8.0, "");
        assert_eq!(machine.aux_bits() & AUX_BIT_FLOOD, AUX_BIT_FLOOD);
        machine.unprocessed('M', 9.0, "");
        assert_eq!(machine.aux_bits() & (AUX_BIT_MIST | AUX_BIT_FLOOD), 0);
    }

    #[test]
    fn spindle_needs_rpm_to_turn_on() {
        let mut machine = control(MachineConfig::default());
        machine.unprocessed('M', 3.0, "");
        assert_eq!(machine.aux_bits() & AUX_BIT_SPINDLE_ON, 0);
        machine.unprocessed('M', 3.0, "S1000");
        assert_eq!(machine.aux_bits() & AUX_BIT_SPINDLE_ON, AUX_BIT_SPINDLE_ON);
        assert_eq!(machine.aux_bits() & AUX_BIT_SPINDLE_DIR, 0);
        machine.unprocessed('M', 4.0, "S1000");
        assert_eq!(machine.aux_bits() & AUX_BIT_SPINDLE_DIR, AUX_BIT_SPINDLE_DIR);
        machine.unprocessed('M', 5.0, "");
        assert_eq!(
            machine.aux_bits() & (AUX_BIT_SPINDLE_ON | AUX_BIT_SPINDLE_DIR),
            0
        );
    }

    #[test]
    fn m42_sets_and_reads_aux_pins() {
        let mut machine = control(MachineConfig::default());
        machine.unprocessed('M', 42.0, "P7 S1");
        assert_eq!(machine.aux_bits() & (1 << 7), 1 << 7);
        machine.unprocessed('M', 63.0, "P7");
        assert_eq!(machine.aux_bits() & (1 << 7), 0);
    }

    #[test]
    fn unknown_m_code_discards_block() {
        let mut machine = control(MachineConfig::default());
        assert_eq!(machine.unprocessed('M', 777.0, "X1 Y2"), None);
    }

    #[test]
    fn non_m_letters_pass_through() {
        let mut machine = control(MachineConfig::default());
        assert_eq!(machine.unprocessed('G', 55.0, "X1"), Some("X1"));
    }

    #[test]
    fn motors_enable_downgrades_homing_confidence() {
        let mut machine = control(MachineConfig::default());
        machine.homing_state = HomingState::Homed;
        machine.motors_enable(true);
        assert_eq!(machine.homing_state(), HomingState::Homed);
        machine.motors_enable(false);
        assert_eq!(
            machine.homing_state(),
            HomingState::HomedButMotorsUnpowered
        );
        assert_eq!(machine.motor_ops().enabled, Some(false));
        // Pure halt sentinels never produce motor segments.
        assert!(machine.motor_ops().queued.is_empty());
    }
}
