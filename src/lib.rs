// src/lib.rs - gantry: lookahead trapezoidal motion planning for machine control

//! Motion-planning core for CNC and 3D-printer machine control.
//!
//! The core consumes abstract toolpath events (coordinated moves, rapids,
//! dwells, homing requests, auxiliary I/O) in real-world millimetre
//! coordinates and emits timed stepper segments (accelerate, cruise,
//! decelerate) for a downstream step-pulse generator. Lookahead over a small
//! planning buffer blends junction speeds between consecutive moves;
//! absolute step positions are the single source of truth, so rounding
//! never accumulates.
//!
//! The toolpath parser, the step-pulse generator, and the GPIO/PWM drivers
//! are external collaborators behind the [`gcode::GCodeEvents`],
//! [`motor::MotorOps`], and [`hardware::Gpio`]/[`hardware::Pwm`] seams.

pub mod axis;
pub mod config;
pub mod gcode;
pub mod hardware;
pub mod machine;
pub mod motion;
pub mod motor;

pub use axis::{axis_bit, AxesRegister, Axis, AxisBitmap, NUM_AXES};
pub use config::{ConfigError, MachineConfig};
pub use gcode::GCodeEvents;
pub use hardware::{Gpio, GpioPin, NullHardware, Pwm};
pub use machine::{EndstopConfig, HomingState, MachineControl};
pub use motion::{AxisTarget, Planner, PlanningBuffer};
pub use motor::{MotorMovement, MotorOps, NUM_MOTORS};
