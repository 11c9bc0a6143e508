//! Keithley 2400 source-measure unit.
//!
//! Readings go to the instrument's trace buffer and are read back in bulk with
//! [`Keithley2400::read_trace`], which de-interleaves them into a [`Trace`].

use fugit::MillisDurationU64;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    command::{InvalidParameter, Limits, Value, format_scpi},
    error::{Error, Result},
    response::{deinterleave, parse_ascii_values},
    scpi,
    settle::{Clock, SystemClock},
    transport::Transport,
};

/// Capacity of the trace buffer.
pub const BUFFER_SIZE: u32 = 2500;
pub const RAMP_INTERVAL: MillisDurationU64 = MillisDurationU64::millis(50);
/// Fields stored per buffered reading: volts, amps, ohms, seconds and the status word.
const TRACE_STRIDE: usize = 5;

const VOLTAGE: Limits = Limits::real(-210.0, 210.0);
const CURRENT: Limits = Limits::real(-1.05, 1.05);
const STEP: Limits = Limits::real(f64::MIN_POSITIVE, f64::MAX);
const SWEEP_POINTS: Limits = Limits::integer(1.0, BUFFER_SIZE as f64);
const RAMP_STEPS: Limits = Limits::integer(1.0, 100_000.0);

const INITIALIZE: [&str; 8] = [
    "*CLS",
    "STATUS:MEASUREMENT:ENABLE 512",
    "*SRE 1",
    "ARM:COUNT 1",
    "TRACE:POINTS 2500",
    "ARM:SOURCE BUS",
    "TRACE:FEED SENSE1",
    "SYSTEM:TIME:RESET:AUTO 0",
];

/// What the instrument drives, and what a compliance limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter, IntoStaticStr)]
pub enum Quantity {
    #[strum(to_string = "VOLTAGE", serialize = "VOLT")]
    Voltage,
    #[strum(to_string = "CURRENT", serialize = "CURR")]
    Current,
}

impl Quantity {
    fn limits(self) -> &'static Limits {
        match self {
            Quantity::Voltage => &VOLTAGE,
            Quantity::Current => &CURRENT,
        }
    }

    fn short(self) -> &'static str {
        match self {
            Quantity::Voltage => "VOLT",
            Quantity::Current => "CURR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum Measurement {
    Voltage,
    Current,
    Resistance,
}

impl Measurement {
    /// Parse the last function of a `SENSE:FUNCTION?` reply such as `"CURR:DC","RES"`.
    fn from_functions(reply: &str) -> Option<Self> {
        let last = reply.trim().rsplit(',').next()?.trim().trim_matches('"');
        match last {
            "VOLT:DC" => Some(Measurement::Voltage),
            "CURR:DC" => Some(Measurement::Current),
            "RES" => Some(Measurement::Resistance),
            _ => None,
        }
    }
}

/// Resistance sensing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sense {
    #[default]
    TwoWire,
    FourWire,
}

/// Buffered readings, one entry per point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    pub volts: Vec<f64>,
    pub amps: Vec<f64>,
    /// Only meaningful when measuring resistance.
    pub ohms: Vec<f64>,
    pub seconds: Vec<f64>,
}

impl Trace {
    pub fn len(&self) -> usize {
        self.volts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volts.is_empty()
    }

    pub fn append(&mut self, other: &mut Trace) {
        self.volts.append(&mut other.volts);
        self.amps.append(&mut other.amps);
        self.ohms.append(&mut other.ohms);
        self.seconds.append(&mut other.seconds);
    }
}

/// Values from `start` to `target` inclusive, at most `step` apart.
pub fn ramp_points(
    start: f64,
    target: f64,
    step: f64,
) -> core::result::Result<Vec<f64>, InvalidParameter> {
    STEP.check("step", step.into())?;
    let intervals = ((target - start).abs() / step).ceil().max(1.0);
    RAMP_STEPS.check("ramp steps", intervals.into())?;
    let intervals = intervals as usize;
    Ok((0..=intervals)
        .map(|i| match i {
            i if i == intervals => target,
            i => start + (target - start) * i as f64 / intervals as f64,
        })
        .collect())
}

pub struct Keithley2400<T: Transport, K: Clock = SystemClock> {
    transport: T,
    clock: K,
}

impl<T: Transport> Keithley2400<T> {
    pub fn new(transport: T) -> Self {
        Self::with_clock(transport, SystemClock::default())
    }
}

impl<T: Transport, K: Clock> Keithley2400<T, K> {
    pub fn with_clock(transport: T, clock: K) -> Self {
        Self { transport, clock }
    }

    /// Enable bus triggered buffering and empty the buffer.
    pub fn initialize(&mut self) -> Result<(), T::Error> {
        for command in INITIALIZE {
            scpi::write(&mut self.transport, command)?;
        }
        self.clear_buffer()
    }

    pub fn identify(&mut self) -> Result<String, T::Error> {
        let identity = scpi::query_text(&mut self.transport, "*IDN?")?;
        if identity.is_empty() {
            return Err(Error::InvalidResponse(identity));
        }
        Ok(identity)
    }

    /// Restore the factory defaults.
    pub fn reset(&mut self) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, "*RST")
    }

    /// Source a constant `value` volts or amps.
    pub fn set_source_dc(&mut self, quantity: Quantity, value: f64) -> Result<(), T::Error> {
        let level = source_command(quantity, "LEVEL", value)?;
        let range = source_command(quantity, "RANGE", value)?;
        self.manual_resistance()?;
        scpi::write(&mut self.transport, &format!("SOURCE:FUNCTION:MODE {quantity}"))?;
        scpi::write(&mut self.transport, &format!("SOURCE:{quantity}:MODE FIXED"))?;
        scpi::write(&mut self.transport, &range)?;
        scpi::write(&mut self.transport, &level)
    }

    /// Configure a linear sweep and return the number of points it will record.
    pub fn set_source_sweep(
        &mut self,
        quantity: Quantity,
        start: f64,
        stop: f64,
        step: f64,
    ) -> Result<u32, T::Error> {
        let commands = [
            source_command(quantity, "RANGE", stop)?,
            source_command(quantity, "START", start)?,
            source_command(quantity, "STOP", stop)?,
            source_command(quantity, "STEP", step)?,
        ];
        STEP.check("step", step.abs().into())?;
        let points = ((stop - start) / step).abs().ceil() + 1.0;
        SWEEP_POINTS.check("sweep points", points.into())?;
        let points = points as u32;
        scpi::write(&mut self.transport, &format!("TRIGGER:COUNT {points}"))?;
        scpi::write(&mut self.transport, &format!("TRACE:POINTS {points}"))?;
        self.manual_resistance()?;
        scpi::write(&mut self.transport, &format!("SOURCE:FUNCTION:MODE {quantity}"))?;
        scpi::write(&mut self.transport, &format!("SOURCE:{quantity}:MODE SWEEP"))?;
        for command in &commands {
            scpi::write(&mut self.transport, command)?;
        }
        log::debug!("sweep of {points} points configured");
        Ok(points)
    }

    pub fn set_measurement(&mut self, measurement: Measurement, sense: Sense) -> Result<(), T::Error> {
        scpi::write(
            &mut self.transport,
            "SENSE:FUNCTION:OFF 'CURR:DC', 'VOLT:DC', 'RES'",
        )?;
        match measurement {
            Measurement::Voltage => {
                scpi::write(&mut self.transport, "SENSE:FUNCTION:ON 'VOLTAGE:DC'")
            }
            Measurement::Current => {
                scpi::write(&mut self.transport, "SENSE:FUNCTION:ON 'CURRENT:DC'")
            }
            Measurement::Resistance => {
                scpi::write(&mut self.transport, "SENSE:FUNCTION:ON 'CURRENT:DC'")?;
                scpi::write(&mut self.transport, "SENSE:FUNCTION:ON 'RESISTANCE'")?;
                let rsense = match sense {
                    Sense::TwoWire => "SYSTEM:RSENSE OFF",
                    Sense::FourWire => "SYSTEM:RSENSE ON",
                };
                scpi::write(&mut self.transport, rsense)
            }
        }
    }

    pub fn measurement(&mut self) -> Result<Measurement, T::Error> {
        let reply = self.transport.query("SENSE:FUNCTION?")?;
        Measurement::from_functions(&reply).ok_or(Error::InvalidResponse(reply))
    }

    /// What is being sourced and at which level.
    pub fn source(&mut self) -> Result<(Quantity, f64), T::Error> {
        let function = scpi::query_text(&mut self.transport, "SOURCE:FUNCTION:MODE?")?;
        let quantity: Quantity = function
            .parse()
            .map_err(|_| Error::InvalidResponse(function))?;
        let level = scpi::query_scalar(&mut self.transport, &format!("SOURCE:{quantity}:LEVEL?"))?;
        Ok((quantity, level))
    }

    /// Limit `quantity` to `limit` volts or amps.
    pub fn set_compliance(&mut self, quantity: Quantity, limit: f64) -> Result<(), T::Error> {
        let header = format!("SENS:{}:PROT", quantity.short());
        let command = format_scpi(&header, limit.into(), quantity.limits())?;
        scpi::write(&mut self.transport, &command)
    }

    pub fn compliance(&mut self, quantity: Quantity) -> Result<f64, T::Error> {
        scpi::query_scalar(&mut self.transport, &format!("SENS:{}:PROT?", quantity.short()))
    }

    pub fn output_on(&mut self) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, "OUTPUT ON")?;
        self.activate_buffer()
    }

    /// Read out the buffer, then switch the output off.
    pub fn output_off(&mut self) -> Result<Trace, T::Error> {
        let trace = self.read_trace()?;
        self.deactivate_buffer()?;
        scpi::write(&mut self.transport, "OUTPUT OFF")?;
        Ok(trace)
    }

    /// Trigger one reading into the buffer. A full buffer is read out first and returned.
    pub fn measure_point(&mut self) -> Result<Option<Trace>, T::Error> {
        let flushed = match self.buffered_points()? {
            points if points >= BUFFER_SIZE as i64 => Some(self.read_trace()?),
            _ => None,
        };
        scpi::write(&mut self.transport, "INIT")?;
        scpi::write(&mut self.transport, "*TRG")?;
        Ok(flushed)
    }

    /// Take a reading and read the buffer back.
    pub fn read_point(&mut self) -> Result<Trace, T::Error> {
        let mut trace = self.measure_point()?.unwrap_or_default();
        trace.append(&mut self.read_trace()?);
        Ok(trace)
    }

    /// Read and clear the buffer.
    pub fn read_trace(&mut self) -> Result<Trace, T::Error> {
        let mut trace = Trace::default();
        if self.buffered_points()? > 0 {
            self.activate_buffer()?;
            let reply = self.transport.query("TRACE:DATA?")?;
            let values = parse_ascii_values(&reply)?;
            if values.len() % TRACE_STRIDE != 0 {
                return Err(Error::InvalidResponse(reply));
            }
            let [volts, amps, ohms, seconds, _status] = deinterleave::<TRACE_STRIDE>(&values);
            trace = Trace {
                volts,
                amps,
                ohms,
                seconds,
            };
        }
        self.clear_buffer()?;
        Ok(trace)
    }

    /// Step the sourced level from `start` to `target`, at most `step` per `interval`.
    pub fn ramp_output(
        &mut self,
        start: f64,
        target: f64,
        step: f64,
        interval: MillisDurationU64,
    ) -> Result<(), T::Error> {
        let points = ramp_points(start, target, step)?;
        let (quantity, _) = self.source()?;
        let commands = points
            .into_iter()
            .map(|level| source_command(quantity, "LEVEL", level))
            .collect::<core::result::Result<Vec<_>, _>>()?;
        for command in &commands {
            scpi::write(&mut self.transport, command)?;
            self.clock.sleep(interval);
        }
        log::debug!("ramped {quantity} from {start} to {target}");
        Ok(())
    }

    /// Switch the output on at zero and ramp up to `target`.
    pub fn ramp_output_on(&mut self, target: f64, step: f64, interval: MillisDurationU64) -> Result<(), T::Error> {
        ramp_points(0.0, target, step)?;
        self.output_on()?;
        self.ramp_output(0.0, target, step, interval)
    }

    /// Ramp down from `start` to zero, then switch the output off.
    pub fn ramp_output_off(&mut self, start: f64, step: f64, interval: MillisDurationU64) -> Result<Trace, T::Error> {
        self.ramp_output(start, 0.0, step, interval)?;
        self.output_off()
    }

    pub fn close(&mut self) -> Result<(), T::Error> {
        self.transport.close()
    }

    fn buffered_points(&mut self) -> Result<i64, T::Error> {
        scpi::query_integer(&mut self.transport, "TRACE:POINTS:ACTUAL?")
    }

    fn manual_resistance(&mut self) -> Result<(), T::Error> {
        if self.measurement()? == Measurement::Resistance {
            scpi::write(&mut self.transport, "SENSE:RESISTANCE:MODE MANUAL")?;
        }
        Ok(())
    }

    fn activate_buffer(&mut self) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, "TRACE:FEED:CONTROL NEXT")
    }

    fn deactivate_buffer(&mut self) -> Result<(), T::Error> {
        scpi::write(&mut self.transport, "TRACE:FEED:CONTROL NEVER")
    }

    fn clear_buffer(&mut self) -> Result<(), T::Error> {
        self.deactivate_buffer()?;
        scpi::write(&mut self.transport, "TRACE:CLEAR")?;
        self.activate_buffer()
    }
}

fn source_command(
    quantity: Quantity,
    leaf: &str,
    value: f64,
) -> core::result::Result<String, InvalidParameter> {
    let header = format!("SOURCE:{quantity}:{leaf}");
    format_scpi(&header, Value::Real(value), quantity.limits())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        endpoint::SessionPolicy, mock_clock::ManualClock, mock_serial::MockSerial,
        transport::Session,
    };

    type Smu = Keithley2400<Session<MockSerial>, ManualClock>;

    fn smu() -> (MockSerial, ManualClock, Smu) {
        let mock = MockSerial::new();
        let clock = ManualClock::new();
        let session = Session::new(mock.clone(), SessionPolicy::Persistent);
        (mock, clock.clone(), Keithley2400::with_clock(session, clock))
    }

    #[test]
    fn initialize_sequence() {
        let (mock, _, mut smu) = smu();
        smu.initialize().unwrap();
        let mut expected: Vec<&str> = INITIALIZE.to_vec();
        expected.extend(["TRACE:FEED:CONTROL NEVER", "TRACE:CLEAR", "TRACE:FEED:CONTROL NEXT"]);
        assert_eq!(mock.written_commands(), expected);
    }

    #[test]
    fn dc_source() {
        let (mock, _, mut smu) = smu();
        mock.queue_replies(["\"VOLT:DC\"\n", "\"CURR:DC\",\"RES\"\n"]);
        smu.set_source_dc(Quantity::Voltage, 5.0).unwrap();
        smu.set_source_dc(Quantity::Current, -1e-3).unwrap();
        assert_eq!(
            mock.written_commands(),
            [
                "SENSE:FUNCTION?",
                "SOURCE:FUNCTION:MODE VOLTAGE",
                "SOURCE:VOLTAGE:MODE FIXED",
                "SOURCE:VOLTAGE:RANGE 5.0",
                "SOURCE:VOLTAGE:LEVEL 5.0",
                "SENSE:FUNCTION?",
                "SENSE:RESISTANCE:MODE MANUAL",
                "SOURCE:FUNCTION:MODE CURRENT",
                "SOURCE:CURRENT:MODE FIXED",
                "SOURCE:CURRENT:RANGE -0.001",
                "SOURCE:CURRENT:LEVEL -0.001",
            ]
        );
    }

    #[test]
    fn source_limits_are_checked_first() {
        let (mock, _, mut smu) = smu();
        assert!(smu.set_source_dc(Quantity::Voltage, 210.5).unwrap_err().is_local());
        assert!(smu.set_source_dc(Quantity::Current, 1.1).unwrap_err().is_local());
        assert!(smu.set_compliance(Quantity::Current, -2.0).unwrap_err().is_local());
        assert!(
            smu.set_source_sweep(Quantity::Voltage, 0.0, 1.0, 0.0)
                .unwrap_err()
                .is_local()
        );
        // 3001 points do not fit the buffer.
        assert!(
            smu.set_source_sweep(Quantity::Voltage, 0.0, 3.0, 1e-3)
                .unwrap_err()
                .is_local()
        );
        assert!(mock.written_data().is_empty());
    }

    #[test]
    fn sweep_point_count() {
        let (mock, _, mut smu) = smu();
        mock.queue_replies(["\"VOLT:DC\"\n", "\"VOLT:DC\"\n"]);
        assert_eq!(smu.set_source_sweep(Quantity::Voltage, 0.0, 1.0, 0.3).unwrap(), 5);
        assert_eq!(smu.set_source_sweep(Quantity::Current, 1e-3, -1e-3, 1e-3).unwrap(), 3);
        let commands = mock.written_commands();
        assert_eq!(
            commands[..9],
            [
                "TRIGGER:COUNT 5",
                "TRACE:POINTS 5",
                "SENSE:FUNCTION?",
                "SOURCE:FUNCTION:MODE VOLTAGE",
                "SOURCE:VOLTAGE:MODE SWEEP",
                "SOURCE:VOLTAGE:RANGE 1.0",
                "SOURCE:VOLTAGE:START 0.0",
                "SOURCE:VOLTAGE:STOP 1.0",
                "SOURCE:VOLTAGE:STEP 0.3",
            ]
        );
        assert_eq!(commands[9], "TRIGGER:COUNT 3");
    }

    #[test]
    fn measurement_functions() {
        let (mock, _, mut smu) = smu();
        mock.queue_replies(["\"CURR:DC\",\"RES\"\n", "\"VOLT:DC\"\n", "\"POW\"\n"]);
        smu.set_measurement(Measurement::Resistance, Sense::FourWire).unwrap();
        assert_eq!(smu.measurement().unwrap(), Measurement::Resistance);
        assert_eq!(smu.measurement().unwrap(), Measurement::Voltage);
        assert!(matches!(smu.measurement(), Err(Error::InvalidResponse(_))));
        assert_eq!(
            mock.written_commands()[..4],
            [
                "SENSE:FUNCTION:OFF 'CURR:DC', 'VOLT:DC', 'RES'",
                "SENSE:FUNCTION:ON 'CURRENT:DC'",
                "SENSE:FUNCTION:ON 'RESISTANCE'",
                "SYSTEM:RSENSE ON",
            ]
        );
    }

    #[test]
    fn source_and_compliance_queries() {
        let (mock, _, mut smu) = smu();
        mock.queue_replies(["CURR\n", "1.000000E-03\n", "2.100000E+01\n"]);
        assert_eq!(smu.source().unwrap(), (Quantity::Current, 1e-3));
        assert_eq!(smu.compliance(Quantity::Voltage).unwrap(), 21.0);
        smu.set_compliance(Quantity::Current, 0.1).unwrap();
        assert_eq!(
            mock.written_commands(),
            [
                "SOURCE:FUNCTION:MODE?",
                "SOURCE:CURRENT:LEVEL?",
                "SENS:VOLT:PROT?",
                "SENS:CURR:PROT 0.1",
            ]
        );
    }

    #[test]
    fn trace_is_deinterleaved() {
        let (mock, _, mut smu) = smu();
        mock.queue_replies([
            "2\n",
            "1.0,1e-3,1000.0,0.5,0,2.0,2e-3,1000.0,1.0,0\n",
        ]);
        let trace = smu.read_trace().unwrap();
        assert_eq!(trace.volts, [1.0, 2.0]);
        assert_eq!(trace.amps, [1e-3, 2e-3]);
        assert_eq!(trace.ohms, [1000.0, 1000.0]);
        assert_eq!(trace.seconds, [0.5, 1.0]);
        assert_eq!(
            mock.written_commands(),
            [
                "TRACE:POINTS:ACTUAL?",
                "TRACE:FEED:CONTROL NEXT",
                "TRACE:DATA?",
                "TRACE:FEED:CONTROL NEVER",
                "TRACE:CLEAR",
                "TRACE:FEED:CONTROL NEXT",
            ]
        );
    }

    #[test]
    fn ragged_trace_is_rejected() {
        let (mock, _, mut smu) = smu();
        mock.queue_replies(["1\n", "1.0,1e-3,1000.0\n"]);
        assert!(matches!(smu.read_trace(), Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn full_buffer_is_flushed_before_measuring() {
        let (mock, _, mut smu) = smu();
        mock.queue_replies(["12\n", "2500\n", "2500\n", "1.0,1e-3,1000.0,0.5,0\n"]);
        assert_eq!(smu.measure_point().unwrap(), None);
        let flushed = smu.measure_point().unwrap().unwrap();
        assert_eq!(flushed.volts, [1.0]);
        let commands = mock.written_commands();
        assert_eq!(commands[..3], ["TRACE:POINTS:ACTUAL?", "INIT", "*TRG"]);
        assert_eq!(commands[commands.len() - 2..], ["INIT", "*TRG"]);
    }

    #[test]
    fn ramp_points_include_both_ends() {
        assert_eq!(ramp_points(0.0, 1.0, 0.5).unwrap(), [0.0, 0.5, 1.0]);
        assert_eq!(
            ramp_points(1.0, 0.0, 0.4).unwrap(),
            [1.0, 1.0 - 1.0 / 3.0, 1.0 - 2.0 / 3.0, 0.0]
        );
        assert_eq!(ramp_points(2.0, 2.0, 0.1).unwrap(), [2.0, 2.0]);
    }

    #[test]
    fn ramp_points_bound_the_step_count() {
        assert!(ramp_points(0.0, 10.0, 1e-300).is_err());
        assert!(ramp_points(0.0, 1.0, 0.0).is_err());
        assert_eq!(ramp_points(0.0, 100_000.0, 1.0).unwrap().len(), 100_001);
        assert!(ramp_points(0.0, 100_001.0, 1.0).is_err());
    }

    #[test]
    fn tiny_ramp_step_leaves_output_off() {
        let (mock, _, mut smu) = smu();
        assert!(matches!(
            smu.ramp_output_on(10.0, 1e-300, RAMP_INTERVAL),
            Err(Error::InvalidParameter(_))
        ));
        assert!(smu.ramp_output(0.0, 10.0, 1e-300, RAMP_INTERVAL).unwrap_err().is_local());
        assert!(mock.written_data().is_empty());
    }

    #[test]
    fn output_ramps() {
        let (mock, clock, mut smu) = smu();
        mock.queue_replies(["VOLT\n", "1.0\n", "VOLT\n", "1.0\n", "0\n"]);
        smu.ramp_output_on(1.0, 0.5, RAMP_INTERVAL).unwrap();
        assert_eq!(clock.elapsed_ms(), 150);
        let trace = smu.ramp_output_off(1.0, 0.5, RAMP_INTERVAL).unwrap();
        assert!(trace.is_empty());
        let commands = mock.written_commands();
        assert_eq!(
            commands[..7],
            [
                "OUTPUT ON",
                "TRACE:FEED:CONTROL NEXT",
                "SOURCE:FUNCTION:MODE?",
                "SOURCE:VOLTAGE:LEVEL?",
                "SOURCE:VOLTAGE:LEVEL 0.0",
                "SOURCE:VOLTAGE:LEVEL 0.5",
                "SOURCE:VOLTAGE:LEVEL 1.0",
            ]
        );
        assert_eq!(commands.last().unwrap(), "OUTPUT OFF");
        assert_eq!(clock.sleeps(), 6);
    }

    #[test]
    fn ramp_refuses_out_of_range_target() {
        let (mock, clock, mut smu) = smu();
        mock.queue_replies(["CURR\n", "0.0\n"]);
        assert!(
            smu.ramp_output(0.0, 2.0, 0.5, RAMP_INTERVAL)
                .unwrap_err()
                .is_local()
        );
        assert_eq!(clock.sleeps(), 0);
        assert_eq!(
            mock.written_commands(),
            ["SOURCE:FUNCTION:MODE?", "SOURCE:CURRENT:LEVEL?"]
        );
    }
}
