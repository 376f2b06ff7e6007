// src/motion/planner.rs - Segmenter: split targets into accel/cruise/decel

use crate::axis::{Axis, NUM_AXES};
use crate::motor::{subtract_steps, MotorMap, MotorMovement, MotorOps};

use super::junction::determine_joining_speed;
use super::AxisTarget;

/// Ramps totalling at most this many millimetres...
const RAMP_SUPPRESS_MM: f64 = 2.0;
/// ...and at most this many steps are dropped entirely; short
/// arc-approximation chatter would otherwise turn into thousands of tiny
/// acceleration segments.
const RAMP_SUPPRESS_STEPS: i32 = 16;

/// Number of steps needed to change from speed `v0` to `*v1` under
/// acceleration `a` (negative `a` decelerates). Lowers `*v1` to the speed
/// actually reachable when the change does not fit into `max_steps`.
pub(crate) fn steps_for_speed_change(a: f64, v0: f64, v1: &mut f64, max_steps: i32) -> f64 {
    // s = v0 * t + a/2 * t^2  with  v1 = v0 + a*t
    let t = (*v1 - v0) / a;
    if t < 0.0 {
        tracing::warn!(
            t,
            "insufficient lookahead: ramp solve yielded negative time, continuing"
        );
    }
    let steps = a / 2.0 * t * t + v0 * t;
    if steps <= max_steps as f64 {
        return steps;
    }
    // Not enough steps available; correct the speed to what we can reach.
    *v1 = (v0 * v0 + 2.0 * a * max_steps as f64).sqrt();
    max_steps as f64
}

/// Reachable peak speed over `s` steps when entering at `v0`, leaving at
/// `v2`, with symmetric acceleration `a`.
pub(crate) fn peak_speed(s: f64, v0: f64, v2: f64, a: f64) -> f64 {
    (v2 * v2 + v0 * v0 + 2.0 * a * s).sqrt() / std::f64::consts::SQRT_2
}

/// The segmenter. Holds the step-domain limits derived from the machine
/// configuration and the axis-to-driver fan-out.
#[derive(Debug, Clone)]
pub struct Planner {
    /// Per-axis acceleration ceiling, steps/s^2.
    max_axis_accel: [f64; NUM_AXES],
    /// Per-axis steps/mm magnitudes.
    steps_per_mm: [f64; NUM_AXES],
    threshold_angle: f64,
    synchronous: bool,
    motor_map: MotorMap,
}

impl Planner {
    pub fn new(
        max_axis_accel: [f64; NUM_AXES],
        steps_per_mm: [f64; NUM_AXES],
        threshold_angle: f64,
        synchronous: bool,
        motor_map: MotorMap,
    ) -> Self {
        Planner {
            max_axis_accel,
            steps_per_mm,
            threshold_angle,
            synchronous,
            motor_map,
        }
    }

    fn acceleration_for_move(&self, target: &AxisTarget) -> f64 {
        self.max_axis_accel[target.defining_axis.index()]
    }

    /// Emit up to three motor segments (accelerate, cruise, decelerate) for
    /// `target`, consulting `last` for the entry speed and `upcoming` for
    /// the junction speed.
    ///
    /// Modifies `target.speed` to the speed the move actually ends at, so
    /// the next call sees the correct entry speed.
    pub fn move_machine_steps(
        &self,
        last: &AxisTarget,
        target: &mut AxisTarget,
        upcoming: &AxisTarget,
        motors: &mut dyn MotorOps,
    ) {
        let defining_axis = target.defining_axis;
        if target.delta_steps[defining_axis.index()] == 0 {
            return;
        }

        debug_assert!(target.speed > 0.0, "speed is always a positive scalar");

        // Aux bits are latched synchronously with the segment they ride on.
        let mut accel_command = MotorMovement {
            aux_bits: target.aux_bits,
            ..MotorMovement::default()
        };
        let mut move_command = accel_command;
        let mut decel_command = accel_command;

        move_command.v0 = target.speed;
        move_command.v1 = target.speed;

        // The previous segment may have had a different defining axis, so
        // project its speed onto ours.
        let last_speed = last.speed_for_axis(defining_axis).abs();

        // Arrive at a speed the upcoming move never has to decelerate from.
        let next_speed = determine_joining_speed(
            target,
            upcoming,
            self.threshold_angle,
            (target.angle - upcoming.angle).abs(),
        );

        let abs_defining_steps = target.delta_steps[defining_axis.index()].abs();
        let a = self.acceleration_for_move(target);
        let peak = peak_speed(abs_defining_steps as f64, last_speed, next_speed, a);
        debug_assert!(peak > 0.0);

        if peak < target.speed {
            target.speed = peak; // requested speed is unreachable on this distance.
        }

        let accel_fraction = if last_speed < target.speed {
            steps_for_speed_change(a, last_speed, &mut target.speed, abs_defining_steps)
                / abs_defining_steps as f64
        } else {
            0.0
        };

        // Only decelerate when the upcoming move is slower.
        let mut clipped_next_speed = next_speed;
        let decel_fraction = if next_speed < target.speed {
            steps_for_speed_change(
                -a,
                target.speed,
                &mut clipped_next_speed,
                abs_defining_steps,
            ) / abs_defining_steps as f64
        } else {
            0.0
        };

        debug_assert!(accel_fraction + decel_fraction <= 1.0 + 1e-4);

        // Tiny ramps only rattle the machine; run them at cruise speed.
        let ramp_steps = ((accel_fraction + decel_fraction) * abs_defining_steps as f64) as i32;
        let ramp_mm = ramp_steps as f64 / self.steps_per_mm[defining_axis.index()];
        let do_ramps = ramp_mm > RAMP_SUPPRESS_MM || ramp_steps > RAMP_SUPPRESS_STEPS;

        let mut has_accel = false;
        let mut has_decel = false;

        if do_ramps && accel_fraction * abs_defining_steps as f64 > 0.0 {
            has_accel = true;
            accel_command.v0 = last_speed;
            accel_command.v1 = target.speed;
            for axis in Axis::ALL {
                let steps =
                    (accel_fraction * target.delta_steps[axis.index()] as f64).round() as i32;
                self.motor_map.assign_steps(&mut accel_command, axis, steps);
            }
        }

        if do_ramps && decel_fraction * abs_defining_steps as f64 > 0.0 {
            has_decel = true;
            decel_command.v0 = target.speed;
            decel_command.v1 = next_speed;
            target.speed = next_speed;
            for axis in Axis::ALL {
                let steps =
                    (decel_fraction * target.delta_steps[axis.index()] as f64).round() as i32;
                self.motor_map.assign_steps(&mut decel_command, axis, steps);
            }
        }

        // The cruise covers whatever the ramps did not: start with all steps
        // and subtract both ramp allocations, so per-axis sums are conserved
        // exactly.
        for axis in Axis::ALL {
            self.motor_map
                .assign_steps(&mut move_command, axis, target.delta_steps[axis.index()]);
        }
        subtract_steps(&mut move_command, &accel_command);
        let has_move = subtract_steps(&mut move_command, &decel_command);

        if self.synchronous {
            motors.drain();
        }
        if has_accel {
            motors.enqueue(accel_command);
        }
        if has_move {
            motors.enqueue(move_command);
        }
        if has_decel {
            motors.enqueue(decel_command);
        }
    }
}
