// src/hardware.rs - Trait seams for the discrete outputs the core touches

/// Discrete I/O lines the control core drives or reads.
///
/// The actual pin wiring belongs to the board support layer; the core only
/// names lines by function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpioPin {
    /// Emergency-stop relay (M0 asserts, M999 releases).
    EstopSwitch,
    /// Main machine power (M80/M81).
    MachinePower,
    /// Status LED, blinked while waiting for the start button.
    StatusLed,
    /// Start button input; high means "hold".
    StartButton,
    /// Part cooling / case fan, PWM capable.
    Fan,
    /// Generic auxiliary output pin, 0..=15 (M42/M62..M65).
    Aux(u8),
    /// Endstop switch connector, 1..=6.
    Endstop(u8),
}

/// Digital reads and writes.
pub trait Gpio {
    fn set(&mut self, pin: GpioPin, value: bool);
    fn read(&mut self, pin: GpioPin) -> bool;
}

/// PWM duty control for lines that support it (fan).
pub trait Pwm {
    fn set_duty(&mut self, pin: GpioPin, duty_cycle: f64);
    fn enable(&mut self, pin: GpioPin, on: bool);
}

/// Hardware implementation that drops writes and reads everything low.
///
/// Useful for machines without auxiliary wiring and for tests that do not
/// exercise homing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHardware;

impl Gpio for NullHardware {
    fn set(&mut self, _pin: GpioPin, _value: bool) {}

    fn read(&mut self, _pin: GpioPin) -> bool {
        false
    }
}

impl Pwm for NullHardware {
    fn set_duty(&mut self, _pin: GpioPin, _duty_cycle: f64) {}

    fn enable(&mut self, _pin: GpioPin, _on: bool) {}
}
