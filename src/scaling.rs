//! Scaling between stepper pulses and angles
//!
//! Motion controllers count position in pulses. This module converts those counts to and from
//! degrees for a stage with a known number of pulses per revolution.

/// Pulses per revolution of the rotation stage.
pub const ROTATOR_PULSES_PER_REVOLUTION: u32 = 50004;

/// Conversion factor between pulse counts and degrees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseScale {
    /// Pulses in a full 360 degree turn
    pub pulses_per_revolution: u32,
}

impl Default for PulseScale {
    /// Default to the rotation stage.
    fn default() -> Self {
        Self::new(ROTATOR_PULSES_PER_REVOLUTION)
    }
}

impl PulseScale {
    pub const fn new(pulses_per_revolution: u32) -> Self {
        Self {
            pulses_per_revolution,
        }
    }

    /// Convert an angle in degrees to the nearest whole pulse count
    #[inline]
    pub fn degrees_to_pulses(&self, degrees: f64) -> i32 {
        (degrees * self.pulses_per_revolution as f64 / 360.0).round() as i32
    }

    /// Convert a pulse count to degrees
    #[inline]
    pub fn pulses_to_degrees(&self, pulses: i32) -> f64 {
        pulses as f64 * 360.0 / self.pulses_per_revolution as f64
    }

    /// Convert a pulse count to degrees, rounded to 0.01 degree
    ///
    /// A single pulse is about 0.0072 degrees, so the second decimal is the last one that means
    /// anything.
    pub fn pulses_to_rounded_degrees(&self, pulses: i32) -> f64 {
        (self.pulses_to_degrees(pulses) * 100.0).round() / 100.0
    }
}
