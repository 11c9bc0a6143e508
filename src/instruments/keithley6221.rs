//! Keithley 6221 AC/DC current source, paired with a 2182A nanovoltmeter for delta mode
//! measurements.
//!
//! The three measurement modes (differential conductance, delta and pulse delta) follow one
//! sequence: every parameter is validated into a command list first, then the running sweep is
//! aborted, the nanovoltmeter is checked for, the commands are written and the mode is armed and
//! triggered. [`Keithley6221::fetch_trace`] then polls the operation event register until the
//! sweep is finished and reads the buffer.

use fugit::MillisDurationU64;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    command::{InvalidParameter, Limits, Param, Value, format_scpi},
    error::{Error, Result},
    instruments::State,
    response::SweepData,
    scpi,
    settle::{Clock, PollBudget, PollState, SystemClock, poll_until},
    transport::Transport,
};

const WAVE_AMPLITUDE: Param = Param::new("SOUR:WAVE:AMPL", "A", Limits::real(2e-12, 105e-3));
const WAVE_OFFSET: Param = Param::new("SOUR:WAVE:OFFS", "A", Limits::real(-103e-3, 103e-3));
const WAVE_RANGE: Param = Param::new("SOUR:WAVE:RANG", "", Limits::tokens(&["BEST", "FIX"]));
const WAVE_FREQUENCY: Param = Param::new("SOUR:WAVE:FREQ", "Hz", Limits::real(1e-3, 1e5));
const SOURCE_RANGE: Param = Param::new("SOUR:CURR:RANG", "A", Limits::real(-105e-3, 105e-3));
const COMPLIANCE: Param = Param::new("SOUR:CURR:COMP", "V", Limits::real(0.1, 105.0));
const OUTPUT: Param = Param::new("OUTP:STAT", "", Limits::integer(0.0, 1.0));

const MARKER_STATE: Param = Param::new("SOUR:WAVE:PMAR:STAT", "", Limits::integer(0.0, 1.0));
const MARKER_LEVEL: Param = Param::new("SOUR:WAVE:PMAR:LEV", "deg", Limits::real(0.0, 360.0));
const MARKER_LINE: Param = Param::new("SOUR:WAVE:PMAR:OLIN", "", Limits::integer(1.0, 6.0));

const AVERAGE_TYPE: Param = Param::new("SENS:AVER:TCON", "", Limits::tokens(&["REP", "MOV"]));
const AVERAGE_COUNT: Param = Param::new("SENS:AVER:COUN", "", Limits::integer(2.0, 300.0));
/// 1 switches the filter off, 2 and up average that many readings.
const FILTER_COUNTS: Limits = Limits::integer(1.0, 300.0);
const COMPLIANCE_ABORT: Limits = Limits::tokens(&["ON", "OFF"]);

const DCON_START: Param = Param::new("SOUR:DCON:STAR", "A", Limits::real(-105e-3, 105e-3));
const DCON_STOP: Param = Param::new("SOUR:DCON:STOP", "A", Limits::real(-105e-3, 105e-3));
const DCON_STEP: Param = Param::new("SOUR:DCON:STEP", "A", Limits::real(f64::MIN_POSITIVE, 105e-3));
const DCON_DELTA: Param = Param::new("SOUR:DCON:DELT", "A", Limits::real(f64::MIN_POSITIVE, 105e-3));
const DCON_DELAY: Param = Param::new("SOUR:DCON:DEL", "s", Limits::real(1e-3, 9999.999));
/// Steps of one conductance sweep, bounded by the trace buffer.
const DCON_POINTS: Limits = Limits::integer(1.0, BUFFER_SIZE as f64);

const DELTA_HIGH: Param = Param::new("SOUR:DELT:HIGH", "A", Limits::real(0.0, 105e-3));
const DELTA_LOW: Param = Param::new("SOUR:DELT:LOW", "A", Limits::real(-105e-3, 0.0));
const DELTA_DELAY: Param = Param::new(
    "SOUR:DELT:DEL",
    "s",
    Limits::real(0.0, 9999.999).with_sentinels(&["INF"]),
);
const DELTA_CYCLES: Param = Param::new(
    "SOUR:DELT:COUN",
    "",
    Limits::integer(1.0, 65536.0).with_sentinels(&["INF"]),
);

const PDEL_HIGH: Param = Param::new("SOUR:PDEL:HIGH", "A", Limits::real(-105e-3, 105e-3));
const PDEL_LOW: Param = Param::new("SOUR:PDEL:LOW", "A", Limits::real(-105e-3, 105e-3));
const PDEL_WIDTH: Param = Param::new("SOUR:PDEL:WIDT", "s", Limits::real(50e-6, 12e-3));
const PDEL_SOURCE_DELAY: Param = Param::new("SOUR:PDEL:SDEL", "s", Limits::real(16e-6, 11.996e-3));
const PDEL_COUNT: Param = Param::new(
    "SOUR:PDEL:COUN",
    "",
    Limits::integer(1.0, 65536.0).with_sentinels(&["INF"]),
);
const TRACE_POINTS: Param = Param::new(
    "TRAC:POIN",
    "",
    Limits::integer(1.0, 65536.0).with_sentinels(&["INF"]),
);
const PDEL_INTERVAL: Param = Param::new("SOUR:PDEL:INT", "", Limits::integer(5.0, 999_999.0));

/// Capacity of the trace buffer.
pub const BUFFER_SIZE: u32 = 65536;
/// Wait between arming conductance mode and triggering it.
pub const DCON_ARM_DELAY: MillisDurationU64 = MillisDurationU64::millis(100);
/// Wait after triggering conductance mode before polling.
pub const DCON_START_DELAY: MillisDurationU64 = MillisDurationU64::secs(3);
/// Wait between arming delta or pulse delta mode and triggering it.
pub const DELTA_ARM_DELAY: MillisDurationU64 = MillisDurationU64::secs(1);
/// Interval between reads of the operation event register.
pub const EVENT_POLL_INTERVAL: MillisDurationU64 = MillisDurationU64::secs(1);
pub const OFFSET_RAMP_STEPS: usize = 1001;
pub const OFFSET_RAMP_INTERVAL: MillisDurationU64 = MillisDurationU64::millis(10);

/// A setting that also accepts `INF`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrInf<T> {
    Finite(T),
    Inf,
}

impl<T: Into<Value<'static>>> OrInf<T> {
    fn into_value(self) -> Value<'static> {
        match self {
            OrInf::Finite(value) => value.into(),
            OrInf::Inf => Value::Token("INF"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter, IntoStaticStr)]
pub enum WaveRange {
    #[strum(serialize = "BEST")]
    Best,
    #[strum(serialize = "FIX")]
    Fixed,
}

/// Averaging filter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumIter, IntoStaticStr)]
pub enum Averaging {
    #[default]
    #[strum(serialize = "REP")]
    Repeating,
    #[strum(serialize = "MOV")]
    Moving,
}

/// Differential conductance sweep settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ConductanceSweepConfig {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
    pub delta: f64,
    /// Seconds between steps.
    pub delay: f64,
    /// Readings averaged per point, 1 for none.
    pub counts: u32,
    pub compliance_abort: bool,
}

impl Default for ConductanceSweepConfig {
    fn default() -> Self {
        Self {
            start: 0.0,
            stop: 0.0,
            step: 1e-6,
            delta: 1e-6,
            delay: 0.05,
            counts: 1,
            compliance_abort: false,
        }
    }
}

impl ConductanceSweepConfig {
    /// Number of steps from `start` to `stop`, rejected when it would not fit the buffer.
    pub fn points(&self) -> core::result::Result<usize, InvalidParameter> {
        let points = ((self.stop - self.start).abs() / self.step + 1e-9).floor() + 1.0;
        DCON_POINTS.check("sweep points", points.into())?;
        Ok(points as usize)
    }

    /// The currents of each step, `start` towards `stop` in steps of `step`.
    pub fn currents(&self) -> core::result::Result<Vec<f64>, InvalidParameter> {
        let points = self.points()?;
        let direction = if self.stop < self.start { -1.0 } else { 1.0 };
        Ok((0..points)
            .map(|i| self.start + direction * i as f64 * self.step)
            .collect())
    }
}

/// Delta mode settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaConfig {
    pub high: f64,
    pub low: f64,
    /// Seconds.
    pub delay: OrInf<f64>,
    /// Readings averaged per point, 1 for none.
    pub counts: u32,
    pub cycles: OrInf<u32>,
    pub compliance_abort: bool,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            high: 0.0,
            low: 0.0,
            delay: OrInf::Finite(0.005),
            counts: 1,
            cycles: OrInf::Finite(1),
            compliance_abort: true,
        }
    }
}

impl DeltaConfig {
    /// The fixed settings of a quick resistance check.
    pub fn quick() -> Self {
        Self {
            high: 1e-6,
            low: -1e-6,
            delay: OrInf::Finite(0.005),
            counts: 5,
            cycles: OrInf::Finite(5),
            compliance_abort: true,
        }
    }
}

/// Pulse delta mode settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseDeltaConfig {
    pub high: f64,
    pub low: f64,
    /// Seconds.
    pub width: f64,
    /// Source delay in seconds.
    pub source_delay: f64,
    pub count: OrInf<u32>,
    /// Power line cycles between pulses.
    pub interval: u32,
}

impl Default for PulseDeltaConfig {
    fn default() -> Self {
        Self {
            high: 0.0,
            low: 0.0,
            width: 200e-6,
            source_delay: 16e-6,
            count: OrInf::Finite(1),
            interval: 5,
        }
    }
}

/// A finished differential conductance sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConductanceSweep {
    pub data: SweepData,
    /// Source current of each point.
    pub currents: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
enum Mode {
    #[strum(serialize = "DCON")]
    Conductance,
    #[strum(serialize = "DELT")]
    Delta,
    #[strum(serialize = "PDEL")]
    PulseDelta,
}

pub struct Keithley6221<T: Transport, K: Clock = SystemClock> {
    transport: T,
    clock: K,
}

impl<T: Transport> Keithley6221<T> {
    pub fn new(transport: T) -> Self {
        Self::with_clock(transport, SystemClock::default())
    }
}

impl<T: Transport, K: Clock> Keithley6221<T, K> {
    pub fn with_clock(transport: T, clock: K) -> Self {
        Self { transport, clock }
    }

    /// Report status registers in ASCII.
    pub fn initialize(&mut self) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, "FORM:SREG ASC")
    }

    pub fn identify(&mut self) -> Result<String, T::Error> {
        scpi::query_text(&mut self.transport, "*IDN?")
    }

    pub fn clear_status(&mut self) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, "*CLS")
    }

    pub fn output(&mut self) -> Result<State, T::Error> {
        match scpi::query_integer(&mut self.transport, "OUTP:STAT?")? {
            0 => Ok(State::Off),
            1 => Ok(State::On),
            other => Err(Error::InvalidResponse(other.to_string())),
        }
    }

    pub fn set_output(&mut self, state: impl Into<State>) -> Result<(), T::Error> {
        scpi::set(&mut self.transport, &OUTPUT, register_bit(state.into()))
    }

    /// Waveform amplitude, peak amps.
    pub fn wave_amplitude(&mut self) -> Result<f64, T::Error> {
        scpi::get(&mut self.transport, &WAVE_AMPLITUDE)
    }

    pub fn set_wave_amplitude(&mut self, amps: f64) -> Result<(), T::Error> {
        scpi::set(&mut self.transport, &WAVE_AMPLITUDE, amps)
    }

    pub fn wave_offset(&mut self) -> Result<f64, T::Error> {
        scpi::get(&mut self.transport, &WAVE_OFFSET)
    }

    pub fn set_wave_offset(&mut self, amps: f64) -> Result<(), T::Error> {
        scpi::set(&mut self.transport, &WAVE_OFFSET, amps)
    }

    /// Walk the waveform offset from its present value to `target` in `steps` evenly spaced
    /// writes, `interval` apart.
    pub fn ramp_wave_offset(
        &mut self,
        target: f64,
        steps: usize,
        interval: MillisDurationU64,
    ) -> Result<(), T::Error> {
        WAVE_OFFSET.check(target)?;
        let start = self.wave_offset()?;
        let last = steps.saturating_sub(1).max(1) as f64;
        for i in 0..steps.max(1) {
            let value = match i as f64 / last {
                fraction if fraction >= 1.0 => target,
                fraction => start + (target - start) * fraction,
            };
            self.clock.sleep(interval);
            scpi::set(&mut self.transport, &WAVE_OFFSET, value)?;
        }
        log::debug!("wave offset ramped from {start} A to {target} A");
        Ok(())
    }

    pub fn wave_range(&mut self) -> Result<WaveRange, T::Error> {
        let range = scpi::query_text(&mut self.transport, &WAVE_RANGE.scpi_query())?;
        range.parse().map_err(|_| Error::InvalidResponse(range))
    }

    pub fn set_wave_range(&mut self, range: WaveRange) -> Result<(), T::Error> {
        let token: &'static str = range.into();
        scpi::set(&mut self.transport, &WAVE_RANGE, token)
    }

    pub fn wave_armed(&mut self) -> Result<bool, T::Error> {
        Ok(scpi::query_integer(&mut self.transport, "SOUR:WAVE:ARM?")? == 1)
    }

    pub fn arm_wave(&mut self) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, "SOUR:WAVE:ARM")
    }

    pub fn abort_wave(&mut self) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, "SOUR:WAVE:ABOR")
    }

    pub fn wave_frequency(&mut self) -> Result<f64, T::Error> {
        scpi::get(&mut self.transport, &WAVE_FREQUENCY)
    }

    pub fn set_wave_frequency(&mut self, hertz: f64) -> Result<(), T::Error> {
        scpi::set(&mut self.transport, &WAVE_FREQUENCY, hertz)
    }

    /// DC source range in amps.
    pub fn source_range(&mut self) -> Result<f64, T::Error> {
        scpi::get(&mut self.transport, &SOURCE_RANGE)
    }

    pub fn set_source_range(&mut self, amps: f64) -> Result<(), T::Error> {
        scpi::set(&mut self.transport, &SOURCE_RANGE, amps)
    }

    /// Voltage compliance in volts.
    pub fn compliance(&mut self) -> Result<f64, T::Error> {
        scpi::get(&mut self.transport, &COMPLIANCE)
    }

    pub fn set_compliance(&mut self, volts: f64) -> Result<(), T::Error> {
        scpi::set(&mut self.transport, &COMPLIANCE, volts)
    }

    /// Fail with [`Error::DeviceFault`] if the measurement event register is not clear.
    pub fn check_compliance(&mut self) -> Result<(), T::Error> {
        match scpi::query_integer(&mut self.transport, "STAT:MEAS?")? {
            0 => Ok(()),
            code => Err(Error::DeviceFault(format!("measurement event register reads {code}"))),
        }
    }

    pub fn press_trigger(&mut self) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, "SYST:KEY 13")
    }

    pub fn press_exit(&mut self) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, "SYST:KEY 11")
    }

    /// Configure the waveform phase marker. `line` leaves the output trigger line unchanged when
    /// `None`.
    pub fn set_phase_marker(
        &mut self,
        state: impl Into<State>,
        level: f64,
        line: Option<u8>,
    ) -> Result<(), T::Error> {
        let mut commands = vec![
            MARKER_STATE.scpi_command(register_bit(state.into()))?,
            MARKER_LEVEL.scpi_command(level)?,
        ];
        if let Some(line) = line {
            commands.push(MARKER_LINE.scpi_command(line)?);
        }
        self.write_all(&commands)
    }

    /// Average `count` (2 to 300) readings per point.
    pub fn filter_on(&mut self, count: u32, averaging: Averaging) -> Result<(), T::Error> {
        let commands = filter_commands(count, averaging)?;
        self.write_all(&commands)
    }

    pub fn filter_off(&mut self) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, "SENS:AVER OFF")
    }

    /// Configure, arm and trigger a differential conductance sweep without waiting for it.
    pub fn start_conductance_sweep(&mut self, config: &ConductanceSweepConfig) -> Result<(), T::Error> {
        let mut commands = vec![
            DCON_START.scpi_command(config.start)?,
            DCON_STOP.scpi_command(config.stop)?,
            DCON_STEP.scpi_command(config.step)?,
            DCON_DELTA.scpi_command(config.delta)?,
            DCON_DELAY.scpi_command(config.delay)?,
            compliance_abort_command(Mode::Conductance, config.compliance_abort)?,
        ];
        commands.extend(counts_commands(config.counts)?);
        config.points()?;
        self.prepare(Mode::Conductance)?;
        self.write_all(&commands)?;
        self.arm_and_trigger(Mode::Conductance, DCON_ARM_DELAY)?;
        self.clock.sleep(DCON_START_DELAY);
        Ok(())
    }

    /// Run a differential conductance sweep and return the readings with their source currents.
    pub fn conductance_sweep(
        &mut self,
        config: &ConductanceSweepConfig,
        budget: &PollBudget,
    ) -> Result<ConductanceSweep, T::Error> {
        let mut currents = config.currents()?;
        self.start_conductance_sweep(config)?;
        let mut data = self.fetch_trace(budget)?;
        let points = currents.len().min(data.len());
        currents.truncate(points);
        data.measurement.truncate(points);
        data.time.truncate(points);
        Ok(ConductanceSweep { data, currents })
    }

    /// Configure, arm and trigger delta mode without waiting for it.
    pub fn start_delta(&mut self, config: &DeltaConfig) -> Result<(), T::Error> {
        let commands = delta_commands(config)?;
        self.prepare(Mode::Delta)?;
        self.write_all(&commands)?;
        self.arm_and_trigger(Mode::Delta, DELTA_ARM_DELAY)
    }

    pub fn delta_measurement(&mut self, config: &DeltaConfig, budget: &PollBudget) -> Result<SweepData, T::Error> {
        self.start_delta(config)?;
        self.fetch_trace(budget)
    }

    /// Delta mode at ±1 µA, five cycles of five averaged readings.
    pub fn quick_measure(&mut self, budget: &PollBudget) -> Result<SweepData, T::Error> {
        let mut commands = vec!["SOUR:SWE:COUN 1".to_string()];
        commands.extend(delta_commands(&DeltaConfig::quick())?);
        self.prepare(Mode::Delta)?;
        self.write_all(&commands)?;
        self.arm_and_trigger(Mode::Delta, MillisDurationU64::millis(0))?;
        self.fetch_trace(budget)
    }

    /// Configure, arm and trigger pulse delta mode without waiting for it.
    pub fn start_pulse_delta(&mut self, config: &PulseDeltaConfig) -> Result<(), T::Error> {
        let commands = [
            PDEL_HIGH.scpi_command(config.high)?,
            PDEL_LOW.scpi_command(config.low)?,
            PDEL_WIDTH.scpi_command(config.width)?,
            PDEL_SOURCE_DELAY.scpi_command(config.source_delay)?,
            PDEL_COUNT.scpi_command(config.count.into_value())?,
            TRACE_POINTS.scpi_command(config.count.into_value())?,
            PDEL_INTERVAL.scpi_command(config.interval)?,
        ];
        scpi::write(&mut self.transport, "SOUR:SWE:ABOR")?;
        scpi::write(&mut self.transport, "SOUR:PDEL:SWE OFF")?;
        self.check_nanovoltmeter(Mode::PulseDelta)?;
        self.write_all(&commands)?;
        self.arm_and_trigger(Mode::PulseDelta, DELTA_ARM_DELAY)
    }

    pub fn pulse_delta_measurement(
        &mut self,
        config: &PulseDeltaConfig,
        budget: &PollBudget,
    ) -> Result<SweepData, T::Error> {
        self.start_pulse_delta(config)?;
        self.fetch_trace(budget)
    }

    /// Wait for the operation event register to clear, read the buffer and stop the sweep.
    pub fn fetch_trace(&mut self, budget: &PollBudget) -> Result<SweepData, T::Error> {
        let transport = &mut self.transport;
        poll_until(&mut self.clock, budget, || {
            match scpi::query_integer(transport, "STAT:OPER:EVEN?")? {
                0 => Ok(PollState::Done),
                events => Ok(PollState::Pending(events.to_string())),
            }
        })?;
        let reply = self.transport.query("TRAC:DATA?")?;
        let data = SweepData::parse(&reply)?;
        scpi::write(&mut self.transport, "SOUR:SWE:ABOR")?;
        log::info!("read {} points", data.len());
        Ok(data)
    }

    pub fn close(&mut self) -> Result<(), T::Error> {
        self.transport.close()
    }

    fn prepare(&mut self, mode: Mode) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, "SOUR:SWE:ABOR")?;
        self.check_nanovoltmeter(mode)
    }

    fn check_nanovoltmeter(&mut self, mode: Mode) -> Result<(), T::Error> {
        let mode: &'static str = mode.into();
        let present = scpi::query_text(&mut self.transport, &format!("SOUR:{mode}:NVPR?"))?;
        match present.as_str() {
            "1" => Ok(()),
            "0" => Err(Error::DeviceFault("2182 nanovoltmeter not detected".into())),
            _ => Err(Error::InvalidResponse(present)),
        }
    }

    fn arm_and_trigger(&mut self, mode: Mode, delay: MillisDurationU64) -> Result<(), T::Error> {
        let mode: &'static str = mode.into();
        scpi::write(&mut self.transport, &format!("SOUR:{mode}:ARM"))?;
        if delay.to_millis() > 0 {
            self.clock.sleep(delay);
        }
        scpi::write(&mut self.transport, "INIT:IMM")
    }

    fn write_all(&mut self, commands: &[String]) -> Result<(), T::Error> {
        commands
            .iter()
            .try_for_each(|command| scpi::write(&mut self.transport, command))
    }
}

fn register_bit(state: State) -> u8 {
    u8::from(bool::from(state))
}

/// Default budget for [`Keithley6221::fetch_trace`]: no timeout.
pub fn event_budget() -> PollBudget {
    PollBudget::new(EVENT_POLL_INTERVAL)
}

fn filter_commands(count: u32, averaging: Averaging) -> core::result::Result<Vec<String>, InvalidParameter> {
    let averaging: &'static str = averaging.into();
    Ok(vec![
        "SENS:AVER OFF".into(),
        AVERAGE_TYPE.scpi_command(averaging)?,
        AVERAGE_COUNT.scpi_command(count)?,
        "SENS:AVER ON".into(),
    ])
}

/// Filter commands for a per-point reading count, 1 meaning no averaging.
fn counts_commands(counts: u32) -> core::result::Result<Vec<String>, InvalidParameter> {
    FILTER_COUNTS.check("filter count", counts.into())?;
    match counts {
        1 => Ok(vec!["SENS:AVER OFF".into()]),
        _ => filter_commands(counts, Averaging::Repeating),
    }
}

fn compliance_abort_command(mode: Mode, enabled: bool) -> core::result::Result<String, InvalidParameter> {
    let mode: &'static str = mode.into();
    let state = State::from(enabled).token();
    format_scpi(&format!("SOUR:{mode}:CAB"), state.into(), &COMPLIANCE_ABORT)
}

fn delta_commands(config: &DeltaConfig) -> core::result::Result<Vec<String>, InvalidParameter> {
    let mut commands = vec![
        DELTA_HIGH.scpi_command(config.high)?,
        DELTA_LOW.scpi_command(config.low)?,
        DELTA_DELAY.scpi_command(config.delay.into_value())?,
        DELTA_CYCLES.scpi_command(config.cycles.into_value())?,
        compliance_abort_command(Mode::Delta, config.compliance_abort)?,
    ];
    commands.extend(counts_commands(config.counts)?);
    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        endpoint::SessionPolicy,
        mock_clock::ManualClock,
        mock_serial::{MockSerial, MockSerialError},
        transport::Session,
    };

    type Source = Keithley6221<Session<MockSerial>, ManualClock>;

    fn source() -> (MockSerial, ManualClock, Source) {
        let mock = MockSerial::new();
        let clock = ManualClock::new();
        let session = Session::new(mock.clone(), SessionPolicy::Persistent);
        (mock, clock.clone(), Keithley6221::with_clock(session, clock))
    }

    fn budget() -> PollBudget {
        event_budget()
    }

    #[test]
    fn conductance_sweep_sequence() {
        let (mock, clock, mut source) = source();
        mock.queue_replies([
            "1\n",
            "4\n",
            "0\n",
            "1.0,\t0.1,\t2.0,\t0.2\n",
        ]);
        let config = ConductanceSweepConfig {
            start: 0.0,
            stop: 2e-3,
            step: 1e-3,
            delta: 1e-4,
            ..Default::default()
        };
        let sweep = source.conductance_sweep(&config, &budget()).unwrap();
        assert_eq!(sweep.data.measurement, [1.0, 2.0]);
        assert_eq!(sweep.data.time, [0.1, 0.2]);
        assert_eq!(sweep.currents, [0.0, 0.001]);
        assert_eq!(
            mock.written_commands(),
            [
                "SOUR:SWE:ABOR",
                "SOUR:DCON:NVPR?",
                "SOUR:DCON:STAR 0.0",
                "SOUR:DCON:STOP 0.002",
                "SOUR:DCON:STEP 0.001",
                "SOUR:DCON:DELT 0.0001",
                "SOUR:DCON:DEL 0.05",
                "SOUR:DCON:CAB OFF",
                "SENS:AVER OFF",
                "SOUR:DCON:ARM",
                "INIT:IMM",
                "STAT:OPER:EVEN?",
                "STAT:OPER:EVEN?",
                "TRAC:DATA?",
                "SOUR:SWE:ABOR",
            ]
        );
        // Arm delay, start delay and one event poll.
        assert_eq!(clock.elapsed_ms(), 100 + 3_000 + 1_000);
    }

    #[test]
    fn invalid_sweep_sends_nothing() {
        let (mock, _, mut source) = source();
        for config in [
            ConductanceSweepConfig { step: 0.0, ..Default::default() },
            ConductanceSweepConfig { start: 0.2, ..Default::default() },
            ConductanceSweepConfig { delay: 0.0, ..Default::default() },
            ConductanceSweepConfig { counts: 301, ..Default::default() },
        ] {
            let err = source.conductance_sweep(&config, &budget()).unwrap_err();
            assert!(err.is_local(), "{config:?}");
        }
        assert!(mock.written_data().is_empty());
    }

    #[test]
    fn sweep_larger_than_buffer_is_rejected() {
        let (mock, _, mut source) = source();
        let tiny_step = ConductanceSweepConfig {
            start: -0.1,
            stop: 0.1,
            step: 1e-300,
            ..Default::default()
        };
        assert!(matches!(
            source.conductance_sweep(&tiny_step, &budget()),
            Err(Error::InvalidParameter(_))
        ));
        let realistic = ConductanceSweepConfig { step: 1e-12, ..tiny_step.clone() };
        assert!(realistic.currents().is_err());
        let full = ConductanceSweepConfig {
            start: 0.0,
            stop: 65535.0 / 1_048_576.0,
            step: 1.0 / 1_048_576.0,
            ..tiny_step
        };
        assert_eq!(full.points().unwrap(), 65536);
        assert!(mock.written_data().is_empty());
    }

    #[test]
    fn missing_nanovoltmeter_is_a_fault() {
        let (mock, _, mut source) = source();
        mock.queue_replies(["0\n", "2\n"]);
        assert!(matches!(
            source.delta_measurement(&DeltaConfig::default(), &budget()),
            Err(Error::DeviceFault(_))
        ));
        assert!(matches!(
            source.delta_measurement(&DeltaConfig::default(), &budget()),
            Err(Error::InvalidResponse(_))
        ));
        assert_eq!(
            mock.written_commands(),
            ["SOUR:SWE:ABOR", "SOUR:DELT:NVPR?", "SOUR:SWE:ABOR", "SOUR:DELT:NVPR?"]
        );
    }

    #[test]
    fn delta_accepts_infinite_settings() {
        let (mock, _, mut source) = source();
        mock.queue_reply("1\n");
        let config = DeltaConfig {
            high: 1e-3,
            low: -1e-3,
            delay: OrInf::Inf,
            cycles: OrInf::Inf,
            counts: 10,
            compliance_abort: false,
        };
        source.start_delta(&config).unwrap();
        assert_eq!(
            mock.written_commands()[2..],
            [
                "SOUR:DELT:HIGH 0.001",
                "SOUR:DELT:LOW -0.001",
                "SOUR:DELT:DEL INF",
                "SOUR:DELT:COUN INF",
                "SOUR:DELT:CAB OFF",
                "SENS:AVER OFF",
                "SENS:AVER:TCON REP",
                "SENS:AVER:COUN 10",
                "SENS:AVER ON",
                "SOUR:DELT:ARM",
                "INIT:IMM",
            ]
        );
        let positive_low = DeltaConfig { low: 1e-3, ..config };
        assert!(source.start_delta(&positive_low).unwrap_err().is_local());
    }

    #[test]
    fn pulse_delta_sequence() {
        let (mock, _, mut source) = source();
        mock.queue_replies(["1\n", "0\n", "5.0e-6,\t0.0\n"]);
        let config = PulseDeltaConfig {
            high: 1e-3,
            low: 0.0,
            count: OrInf::Finite(1),
            ..Default::default()
        };
        let data = source.pulse_delta_measurement(&config, &budget()).unwrap();
        assert_eq!(data.measurement, [5.0e-6]);
        assert_eq!(
            mock.written_commands(),
            [
                "SOUR:SWE:ABOR",
                "SOUR:PDEL:SWE OFF",
                "SOUR:PDEL:NVPR?",
                "SOUR:PDEL:HIGH 0.001",
                "SOUR:PDEL:LOW 0.0",
                "SOUR:PDEL:WIDT 0.0002",
                "SOUR:PDEL:SDEL 1.6e-5",
                "SOUR:PDEL:COUN 1",
                "TRAC:POIN 1",
                "SOUR:PDEL:INT 5",
                "SOUR:PDEL:ARM",
                "INIT:IMM",
                "STAT:OPER:EVEN?",
                "TRAC:DATA?",
                "SOUR:SWE:ABOR",
            ]
        );
        let bad = PulseDeltaConfig { interval: 4, ..config };
        assert!(source.start_pulse_delta(&bad).unwrap_err().is_local());
    }

    #[test]
    fn quick_measure_uses_fixed_settings() {
        let (mock, _, mut source) = source();
        mock.queue_replies(["1\n", "0\n", "1e-3,0.5,1.1e-3,1.0\n"]);
        let data = source.quick_measure(&budget()).unwrap();
        assert_eq!(data.measurement, [1e-3, 1.1e-3]);
        let commands = mock.written_commands();
        assert_eq!(commands[2], "SOUR:SWE:COUN 1");
        assert_eq!(commands[3], "SOUR:DELT:HIGH 1e-6");
        assert!(commands.contains(&"SENS:AVER:COUN 5".to_string()));
        assert!(commands.contains(&"SOUR:DELT:COUN 5".to_string()));
    }

    #[test]
    fn event_poll_honours_deadline() {
        let (mock, _, mut source) = source();
        mock.queue_replies(["3\n", "3\n", "3\n"]);
        let budget = budget().with_timeout(MillisDurationU64::secs(2));
        assert!(matches!(
            source.fetch_trace(&budget),
            Err(Error::DeadlineExceeded { attempts: 3, .. })
        ));
    }

    #[test]
    fn source_settings() {
        let (mock, _, mut source) = source();
        mock.queue_replies(["1\n", "FIX\n", "0\n", "KEITHLEY INSTRUMENTS INC.,MODEL 6221\n"]);
        source.initialize().unwrap();
        source.set_output(true).unwrap();
        source.set_wave_amplitude(2e-12).unwrap();
        source.set_wave_range(WaveRange::Best).unwrap();
        source.set_wave_frequency(1e5).unwrap();
        source.set_source_range(-105e-3).unwrap();
        source.set_compliance(10.0).unwrap();
        assert!(source.set_wave_offset(0.104).is_err());
        assert!(source.set_compliance(0.05).is_err());
        assert_eq!(source.output().unwrap(), State::On);
        assert_eq!(source.wave_range().unwrap(), WaveRange::Fixed);
        assert!(!source.wave_armed().unwrap());
        assert!(source.identify().unwrap().contains("6221"));
        assert_eq!(
            mock.written_commands()[..7],
            [
                "FORM:SREG ASC",
                "OUTP:STAT 1",
                "SOUR:WAVE:AMPL 2e-12",
                "SOUR:WAVE:RANG BEST",
                "SOUR:WAVE:FREQ 100000.0",
                "SOUR:CURR:RANG -0.105",
                "SOUR:CURR:COMP 10.0",
            ]
        );
    }

    #[test]
    fn compliance_check() {
        let (mock, _, mut source) = source();
        mock.queue_replies(["0\n", "+8\n"]);
        source.check_compliance().unwrap();
        assert!(matches!(
            source.check_compliance(),
            Err(Error::DeviceFault(fault)) if fault.contains('8')
        ));
    }

    #[test]
    fn offset_ramp() {
        let (mock, clock, mut source) = source();
        mock.queue_reply("0.0\n");
        source
            .ramp_wave_offset(1e-3, 3, OFFSET_RAMP_INTERVAL)
            .unwrap();
        assert_eq!(
            mock.written_commands(),
            [
                "SOUR:WAVE:OFFS?",
                "SOUR:WAVE:OFFS 0.0",
                "SOUR:WAVE:OFFS 0.0005",
                "SOUR:WAVE:OFFS 0.001",
            ]
        );
        assert_eq!(clock.elapsed_ms(), 30);
        assert!(source.ramp_wave_offset(0.2, 3, OFFSET_RAMP_INTERVAL).is_err());
    }

    #[test]
    fn phase_marker_and_filter() {
        let (mock, _, mut source) = source();
        source.set_phase_marker(true, 180.0, Some(3)).unwrap();
        source.set_phase_marker(false, 90.0, None).unwrap();
        assert!(source.set_phase_marker(true, 180.0, Some(7)).is_err());
        source.filter_on(20, Averaging::Moving).unwrap();
        assert!(source.filter_on(1, Averaging::Moving).is_err());
        assert_eq!(
            mock.written_commands(),
            [
                "SOUR:WAVE:PMAR:STAT 1",
                "SOUR:WAVE:PMAR:LEV 180.0",
                "SOUR:WAVE:PMAR:OLIN 3",
                "SOUR:WAVE:PMAR:STAT 0",
                "SOUR:WAVE:PMAR:LEV 90.0",
                "SENS:AVER OFF",
                "SENS:AVER:TCON MOV",
                "SENS:AVER:COUN 20",
                "SENS:AVER ON",
            ]
        );
    }

    #[test]
    fn transport_errors_propagate() {
        let (mock, _, mut source) = source();
        mock.set_write_error(true);
        assert!(matches!(
            source.clear_status(),
            Err(Error::Transport(MockSerialError::SimulatedError))
        ));
    }
}
