// src/motion/junction.rs - Allowable speed at the boundary between two moves

use crate::axis::Axis;

use super::AxisTarget;

/// Relative tolerance for the cross-axis consistency test. Kept tight; under
/// step quantisation this makes most non-collinear multi-axis junctions
/// resolve to a full stop.
const AXIS_CONSISTENCY_TOLERANCE: f64 = 1e-5;

fn within_acceptable_range(new_val: f64, old_val: f64, fraction: f64) -> bool {
    let max_diff = fraction * old_val;
    new_val >= old_val - max_diff && new_val <= old_val + max_diff
}

/// Determine the speed (steps/s on `from`'s defining axis) that `from` may
/// carry into `to` without violating `to`'s per-axis speeds or reversing a
/// motor abruptly.
///
/// `corner_angle` is the absolute XY heading difference of the two moves;
/// when it stays below `threshold_angle` the corner is gentle enough to keep
/// full speed and all per-axis tests are skipped.
pub fn determine_joining_speed(
    from: &AxisTarget,
    to: &AxisTarget,
    threshold_angle: f64,
    corner_angle: f64,
) -> f64 {
    let mut is_first = true;
    let mut from_defining_speed = from.speed;

    for axis in Axis::ALL {
        let from_delta = from.delta_steps[axis.index()];
        let to_delta = to.delta_steps[axis.index()];

        // Quick integer decisions first.
        if corner_angle < threshold_angle {
            continue;
        }
        if from_delta == 0 && to_delta == 0 {
            continue; // no move on this axis.
        }
        if from_delta == 0 || to_delta == 0 {
            return 0.0; // accelerate from or to zero.
        }
        if (from_delta < 0) != (to_delta < 0) {
            return 0.0; // turning around.
        }

        let to_speed = to.speed_for_axis(axis);
        // What would this speed be, translated to our defining axis?
        let speed_conversion =
            from.delta_steps[from.defining_axis.index()] as f64 / from_delta as f64;
        let goal = to_speed * speed_conversion;
        if goal < 0.0 {
            return 0.0;
        }
        if is_first || within_acceptable_range(goal, from_defining_speed, AXIS_CONSISTENCY_TOLERANCE)
        {
            if goal < from_defining_speed {
                from_defining_speed = goal;
            }
            is_first = false;
        } else {
            return 0.0; // axes disagree about the junction.
        }
    }
    from_defining_speed
}
