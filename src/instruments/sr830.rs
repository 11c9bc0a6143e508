//! Stanford Research Systems SR830 DSP lock-in amplifier.

use fugit::MicrosDurationU64;
use modular_bitfield::prelude::*;
use strum_macros::{Display, EnumIter, FromRepr};

use crate::{
    command::{InvalidParameter, Limits, Param},
    error::{Error, Result},
    scpi,
    transport::Transport,
};

const FREQUENCY: Param = Param::new("FREQ", "Hz", Limits::real(0.001, 102_000.0));
const PHASE: Param = Param::new("PHAS", "deg", Limits::real(-360.0, 729.99));
const AMPLITUDE: Param = Param::new("SLVL", "V", Limits::real(0.004, 5.0));
const SYNC_FILTER: Param = Param::new("SYNC", "", Limits::integer(0.0, 1.0));
const FILTER_SLOPE: Param = Param::new("OFSL", "", Limits::integer(0.0, 3.0));
const RESERVE: Param = Param::new("RMOD", "", Limits::integer(0.0, 2.0));
const INPUT: Param = Param::new("ISRC", "", Limits::integer(0.0, 3.0));
const TIME_CONSTANT: Param = Param::new("OFLT", "", Limits::integer(0.0, 19.0));
const SENSITIVITY: Param = Param::new("SENS", "", Limits::integer(0.0, 26.0));
const SNAP_COUNT: Limits = Limits::integer(2.0, 6.0);
const DISPLAY_CHANNEL: Limits = Limits::integer(1.0, 2.0);
const DISPLAY: Limits = Limits::integer(0.0, 4.0);
const RATIO: Limits = Limits::integer(0.0, 2.0);

/// Time constants selectable with `OFLT`, by index.
pub const TIME_CONSTANTS: [MicrosDurationU64; 20] = [
    MicrosDurationU64::micros(10),
    MicrosDurationU64::micros(30),
    MicrosDurationU64::micros(100),
    MicrosDurationU64::micros(300),
    MicrosDurationU64::millis(1),
    MicrosDurationU64::millis(3),
    MicrosDurationU64::millis(10),
    MicrosDurationU64::millis(30),
    MicrosDurationU64::millis(100),
    MicrosDurationU64::millis(300),
    MicrosDurationU64::secs(1),
    MicrosDurationU64::secs(3),
    MicrosDurationU64::secs(10),
    MicrosDurationU64::secs(30),
    MicrosDurationU64::secs(100),
    MicrosDurationU64::secs(300),
    MicrosDurationU64::secs(1_000),
    MicrosDurationU64::secs(3_000),
    MicrosDurationU64::secs(10_000),
    MicrosDurationU64::secs(30_000),
];

/// Full scale sensitivities selectable with `SENS`, in volts (amps scale by 1e-6).
pub const SENSITIVITIES: [f64; 27] = [
    2e-9, 5e-9, 1e-8, 2e-8, 5e-8, 1e-7, 2e-7, 5e-7, 1e-6, 2e-6, 5e-6, 1e-5, 2e-5, 5e-5, 1e-4,
    2e-4, 5e-4, 1e-3, 2e-3, 5e-3, 1e-2, 2e-2, 5e-2, 0.1, 0.2, 0.5, 1.0,
];

/// Low pass filter roll-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, FromRepr)]
#[repr(u8)]
pub enum FilterSlope {
    #[strum(serialize = "6 dB/oct")]
    Db6 = 0,
    #[strum(serialize = "12 dB/oct")]
    Db12 = 1,
    #[strum(serialize = "18 dB/oct")]
    Db18 = 2,
    #[strum(serialize = "24 dB/oct")]
    Db24 = 3,
}

impl FilterSlope {
    pub fn db_per_octave(self) -> u8 {
        (self as u8 + 1) * 6
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, FromRepr)]
#[repr(u8)]
pub enum Reserve {
    High = 0,
    Normal = 1,
    LowNoise = 2,
}

/// Signal input configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, FromRepr)]
#[repr(u8)]
pub enum Input {
    A = 0,
    AMinusB = 1,
    /// Current input, 1 MΩ gain.
    I1MOhm = 2,
    /// Current input, 100 MΩ gain.
    I100MOhm = 3,
}

/// Quantities readable with `OUTP?` and `SNAP?`. `OUTP?` only accepts the first four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, FromRepr)]
#[repr(u8)]
pub enum Output {
    X = 1,
    Y = 2,
    R = 3,
    Theta = 4,
    AuxIn1 = 5,
    AuxIn2 = 6,
    AuxIn3 = 7,
    AuxIn4 = 8,
    ReferenceFrequency = 9,
    Channel1Display = 10,
    Channel2Display = 11,
}

/// What `AOFF` offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[repr(u8)]
pub enum OffsetTarget {
    X = 1,
    Y = 2,
    R = 3,
}

/// `DDEF` display configuration of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayConfig {
    /// 0 X (Y), 1 R (θ), 2 X noise (Y noise), 3 aux in 1 (3), 4 aux in 2 (4).
    pub display: u8,
    /// 0 none, 1 aux in 1 (3), 2 aux in 2 (4).
    pub ratio: u8,
}

/// LIA status byte, `LIAS?`. Bits latch until read.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiaStatus {
    pub input_overload: bool,
    pub filter_overload: bool,
    pub output_overload: bool,
    pub reference_unlock: bool,
    pub range_changed: bool,
    pub time_constant_changed: bool,
    pub data_triggered: bool,
    #[skip]
    __: B1,
}

pub struct Sr830<T: Transport> {
    transport: T,
}

impl<T: Transport> Sr830<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Reference frequency in Hz.
    pub fn frequency(&mut self) -> Result<f64, T::Error> {
        scpi::get(&mut self.transport, &FREQUENCY)
    }

    pub fn set_frequency(&mut self, hertz: f64) -> Result<(), T::Error> {
        scpi::set(&mut self.transport, &FREQUENCY, hertz)
    }

    /// Reference phase shift in degrees.
    pub fn phase(&mut self) -> Result<f64, T::Error> {
        scpi::get(&mut self.transport, &PHASE)
    }

    pub fn set_phase(&mut self, degrees: f64) -> Result<(), T::Error> {
        scpi::set(&mut self.transport, &PHASE, degrees)
    }

    /// Sine output amplitude in volts RMS.
    pub fn amplitude(&mut self) -> Result<f64, T::Error> {
        scpi::get(&mut self.transport, &AMPLITUDE)
    }

    pub fn set_amplitude(&mut self, volts: f64) -> Result<(), T::Error> {
        scpi::set(&mut self.transport, &AMPLITUDE, volts)
    }

    /// Synchronous filter below 200 Hz.
    pub fn sync_filter(&mut self) -> Result<bool, T::Error> {
        Ok(self.query_index(&SYNC_FILTER)? == 1)
    }

    pub fn set_sync_filter(&mut self, enabled: bool) -> Result<(), T::Error> {
        scpi::set(&mut self.transport, &SYNC_FILTER, u8::from(enabled))
    }

    pub fn filter_slope(&mut self) -> Result<FilterSlope, T::Error> {
        let index = self.query_index(&FILTER_SLOPE)?;
        FilterSlope::from_repr(index).ok_or_else(|| Error::InvalidResponse(index.to_string()))
    }

    pub fn set_filter_slope(&mut self, slope: FilterSlope) -> Result<(), T::Error> {
        scpi::set(&mut self.transport, &FILTER_SLOPE, slope as u8)
    }

    pub fn reserve(&mut self) -> Result<Reserve, T::Error> {
        let index = self.query_index(&RESERVE)?;
        Reserve::from_repr(index).ok_or_else(|| Error::InvalidResponse(index.to_string()))
    }

    pub fn set_reserve(&mut self, reserve: Reserve) -> Result<(), T::Error> {
        scpi::set(&mut self.transport, &RESERVE, reserve as u8)
    }

    pub fn input(&mut self) -> Result<Input, T::Error> {
        let index = self.query_index(&INPUT)?;
        Input::from_repr(index).ok_or_else(|| Error::InvalidResponse(index.to_string()))
    }

    pub fn set_input(&mut self, input: Input) -> Result<(), T::Error> {
        scpi::set(&mut self.transport, &INPUT, input as u8)
    }

    pub fn time_constant_index(&mut self) -> Result<u8, T::Error> {
        self.query_index(&TIME_CONSTANT)
    }

    pub fn time_constant(&mut self) -> Result<MicrosDurationU64, T::Error> {
        let index = self.time_constant_index()?;
        TIME_CONSTANTS
            .get(usize::from(index))
            .copied()
            .ok_or_else(|| Error::InvalidResponse(index.to_string()))
    }

    /// Select a time constant by index, 0 (10 µs) to 19 (30 ks).
    pub fn set_time_constant_index(&mut self, index: u8) -> Result<(), T::Error> {
        scpi::set(&mut self.transport, &TIME_CONSTANT, index)
    }

    /// Select the time constant equal to `duration`, which must be one of [`TIME_CONSTANTS`].
    pub fn set_time_constant(&mut self, duration: MicrosDurationU64) -> Result<(), T::Error> {
        let index = TIME_CONSTANTS
            .iter()
            .position(|candidate| *candidate == duration)
            .ok_or_else(|| InvalidParameter {
                name: TIME_CONSTANT.noun.into(),
                value: format!("{} us", duration.to_micros()),
                limits: TIME_CONSTANT.limits,
            })?;
        self.set_time_constant_index(index as u8)
    }

    /// Move one time constant up or down, stopping at either end. Returns the new index.
    pub fn step_time_constant(&mut self, up: bool) -> Result<u8, T::Error> {
        let index = self.time_constant_index()?;
        let next = match up {
            true => index.saturating_add(1).min(19),
            false => index.saturating_sub(1),
        };
        if next != index {
            self.set_time_constant_index(next)?;
        }
        Ok(next)
    }

    pub fn sensitivity_index(&mut self) -> Result<u8, T::Error> {
        self.query_index(&SENSITIVITY)
    }

    /// Full scale sensitivity in volts.
    pub fn sensitivity(&mut self) -> Result<f64, T::Error> {
        let index = self.sensitivity_index()?;
        SENSITIVITIES
            .get(usize::from(index))
            .copied()
            .ok_or_else(|| Error::InvalidResponse(index.to_string()))
    }

    /// Select a sensitivity by index, 0 (2 nV) to 26 (1 V).
    pub fn set_sensitivity_index(&mut self, index: u8) -> Result<(), T::Error> {
        scpi::set(&mut self.transport, &SENSITIVITY, index)
    }

    /// Configure what front panel channel 1 or 2 shows.
    pub fn set_display(&mut self, channel: u8, config: DisplayConfig) -> Result<(), T::Error> {
        let channel = DISPLAY_CHANNEL.check("display channel", channel.into())?;
        let display = DISPLAY.check("display", config.display.into())?;
        let ratio = RATIO.check("display ratio", config.ratio.into())?;
        scpi::write(&mut self.transport, &format!("DDEF {channel},{display},{ratio}"))
    }

    pub fn display(&mut self, channel: u8) -> Result<DisplayConfig, T::Error> {
        let channel = DISPLAY_CHANNEL.check("display channel", channel.into())?;
        let values = scpi::query_values(&mut self.transport, &format!("DDEF? {channel}"))?;
        match values.as_slice() {
            [display, ratio] => Ok(DisplayConfig {
                display: *display as u8,
                ratio: *ratio as u8,
            }),
            _ => Err(Error::InvalidResponse(format!("{values:?}"))),
        }
    }

    /// Read one of X, Y, R or θ.
    pub fn output(&mut self, output: Output) -> Result<f64, T::Error> {
        let index = Limits::integer(1.0, 4.0).check("OUTP? parameter", (output as u8).into())?;
        scpi::query_scalar(&mut self.transport, &format!("OUTP? {index}"))
    }

    /// Read 2 to 6 quantities at the same instant.
    pub fn snap(&mut self, outputs: &[Output]) -> Result<Vec<f64>, T::Error> {
        let count = i64::try_from(outputs.len()).unwrap_or(i64::MAX);
        SNAP_COUNT.check("SNAP? parameter count", count.into())?;
        let list = outputs
            .iter()
            .map(|output| (*output as u8).to_string())
            .collect::<Vec<_>>()
            .join(",");
        let values = scpi::query_values(&mut self.transport, &format!("SNAP? {list}"))?;
        if values.len() != outputs.len() {
            return Err(Error::InvalidResponse(format!("{values:?}")));
        }
        Ok(values)
    }

    /// Press Auto Gain. Does nothing for time constants above 1 s.
    pub fn auto_gain(&mut self) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, "AGAN")
    }

    pub fn auto_reserve(&mut self) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, "ARSV")
    }

    pub fn auto_phase(&mut self) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, "APHS")
    }

    pub fn auto_offset(&mut self, target: OffsetTarget) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, &format!("AOFF {}", target as u8))
    }

    /// Read and clear the LIA status byte.
    pub fn lia_status(&mut self) -> Result<LiaStatus, T::Error> {
        let byte = scpi::query_integer(&mut self.transport, "LIAS?")?;
        let byte = u8::try_from(byte).map_err(|_| Error::InvalidResponse(byte.to_string()))?;
        Ok(LiaStatus::from_bytes([byte]))
    }

    fn query_index(&mut self, param: &Param) -> Result<u8, T::Error> {
        let index = scpi::query_integer(&mut self.transport, &param.scpi_query())?;
        u8::try_from(index).map_err(|_| Error::InvalidResponse(index.to_string()))
    }

    pub fn close(&mut self) -> Result<(), T::Error> {
        self.transport.close()
    }
}
