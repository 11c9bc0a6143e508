//! Oxford Instruments Mercury iPS superconducting magnet power supply (Teslatron, Z axis).

use fugit::MillisDurationU64;

use crate::{
    command::{Limits, Param},
    dispatch::{BoxedTransport, DispatchTable},
    endpoint::Endpoint,
    error::{Error, Result},
    instruments::State,
    oxford,
    settle::{Clock, PollBudget, PollState, SystemClock, poll_until},
    transport::Transport,
};

const FIELD_SETPOINT: Param = Param::new("DEV:GRPZ:PSU:SIG:FSET", "T", Limits::real(-12.0, 12.0));
const FIELD_RAMP_RATE: Param = Param::new("DEV:GRPZ:PSU:SIG:RFST", "T/m", Limits::at_least(0.0));
const CURRENT_SETPOINT: Param = Param::new("DEV:GRPZ:PSU:SIG:CSET", "A", Limits::unbounded());
const CURRENT_RAMP_RATE: Param = Param::new("DEV:GRPZ:PSU:SIG:RCST", "A/m", Limits::at_least(0.0));
const SWITCH_HEATER: Param = Param::new("DEV:GRPZ:PSU:SIG:SWHT", "", Limits::tokens(&["ON", "OFF"]));
const FIELD: &str = "DEV:GRPZ:PSU:SIG:FLD";
const PERSISTENT_FIELD: &str = "DEV:GRPZ:PSU:SIG:PFLD";
const ACTION: &str = "DEV:GRPZ:PSU:ACTN";
const RAMP_TO_SETPOINT: &str = "DEV:GRPZ:PSU:ACTN:RTOS";
const RAMP_TO_ZERO: &str = "DEV:GRPZ:PSU:ACTN:RTOZ";
const HOLD: &str = "DEV:GRPZ:PSU:ACTN:HOLD";
const CLAMP: &str = "DEV:GRPZ:PSU:ACTN:CLMP";
const MAGNET_TEMPERATURE: &str = "DEV:MB1.T1:TEMP:SIG:TEMP";
const PT1_TEMPERATURE: &str = "DEV:DB8.T1:TEMP:SIG:TEMP";
const PT2_TEMPERATURE: &str = "DEV:DB7.T1:TEMP:SIG:TEMP";

/// Acknowledgement of a ramp request the supply is not ready to accept yet.
const NOT_READY: &str = "NOT_RDY";

/// Interval between retries of a ramp request.
pub const RAMP_RETRY_INTERVAL: MillisDurationU64 = MillisDurationU64::secs(5);
/// Interval between checks for the HOLD state.
pub const HOLD_POLL_INTERVAL: MillisDurationU64 = MillisDurationU64::secs(1);
/// Time the persistent switch heater needs to warm up or cool down.
pub const SWITCH_HEATER_DELAY: MillisDurationU64 = MillisDurationU64::secs(600);

/// Waiting behaviour of the compound persistent mode operations.
#[derive(Debug, Clone)]
pub struct PersistentModeConfig {
    /// Pause after switching the heater.
    pub heater_delay: MillisDurationU64,
    /// Used while retrying ramp requests.
    pub ramp: PollBudget,
    /// Used while waiting for the supply to hold.
    pub hold: PollBudget,
}

impl Default for PersistentModeConfig {
    fn default() -> Self {
        Self {
            heater_delay: SWITCH_HEATER_DELAY,
            ramp: PollBudget::new(RAMP_RETRY_INTERVAL),
            hold: PollBudget::new(HOLD_POLL_INTERVAL),
        }
    }
}

pub struct MercuryIps<T: Transport, K: Clock = SystemClock> {
    transport: T,
    clock: K,
}

impl<T: Transport> MercuryIps<T> {
    pub fn new(transport: T) -> Self {
        Self::with_clock(transport, SystemClock::default())
    }
}

impl<E: embedded_io::Error + 'static> MercuryIps<BoxedTransport<E>> {
    /// Build from a dispatch table. Unsupported modes fail here, before any I/O.
    pub fn open(table: &DispatchTable<E>, mode: &str, endpoint: &Endpoint) -> Result<Self, E> {
        table.open(mode, endpoint).map(Self::new)
    }
}

impl<T: Transport, K: Clock> MercuryIps<T, K> {
    pub fn with_clock(transport: T, clock: K) -> Self {
        Self { transport, clock }
    }

    /// Return the field setpoint in tesla.
    pub fn field_setpoint(&mut self) -> Result<f64, T::Error> {
        oxford::read(&mut self.transport, &FIELD_SETPOINT)
    }

    /// Set the field setpoint (±12 T) and return the value the supply reports back.
    pub fn set_field_setpoint(&mut self, tesla: f64) -> Result<f64, T::Error> {
        oxford::set(&mut self.transport, &FIELD_SETPOINT, tesla)?;
        self.field_setpoint()
    }

    /// Return the field ramp rate in tesla per minute.
    pub fn field_ramp_rate(&mut self) -> Result<f64, T::Error> {
        oxford::read(&mut self.transport, &FIELD_RAMP_RATE)
    }

    pub fn set_field_ramp_rate(&mut self, tesla_per_minute: f64) -> Result<(), T::Error> {
        oxford::set(&mut self.transport, &FIELD_RAMP_RATE, tesla_per_minute)?;
        Ok(())
    }

    /// Return the current setpoint in amps.
    pub fn current_setpoint(&mut self) -> Result<f64, T::Error> {
        oxford::read(&mut self.transport, &CURRENT_SETPOINT)
    }

    pub fn set_current_setpoint(&mut self, amps: f64) -> Result<(), T::Error> {
        oxford::set(&mut self.transport, &CURRENT_SETPOINT, amps)?;
        Ok(())
    }

    /// Return the current ramp rate in amps per minute.
    pub fn current_ramp_rate(&mut self) -> Result<f64, T::Error> {
        oxford::read(&mut self.transport, &CURRENT_RAMP_RATE)
    }

    pub fn set_current_ramp_rate(&mut self, amps_per_minute: f64) -> Result<(), T::Error> {
        oxford::set(&mut self.transport, &CURRENT_RAMP_RATE, amps_per_minute)?;
        Ok(())
    }

    /// Return the field the supply is currently outputting.
    pub fn magnetic_field(&mut self) -> Result<f64, T::Error> {
        oxford::read_value(&mut self.transport, FIELD, "T")
    }

    /// Return the field trapped in the magnet itself.
    pub fn persistent_field(&mut self) -> Result<f64, T::Error> {
        oxford::read_value(&mut self.transport, PERSISTENT_FIELD, "T")
    }

    /// Return the current action: `HOLD`, `RTOS`, `RTOZ` or `CLMP`.
    pub fn action_status(&mut self) -> Result<String, T::Error> {
        oxford::read_token(&mut self.transport, ACTION)
    }

    pub fn switch_heater(&mut self) -> Result<State, T::Error> {
        let token = oxford::read_token(&mut self.transport, SWITCH_HEATER.noun)?;
        token
            .parse()
            .map_err(|_| Error::InvalidResponse(token))
    }

    pub fn set_switch_heater(&mut self, state: impl Into<State>) -> Result<(), T::Error> {
        oxford::set(&mut self.transport, &SWITCH_HEATER, state.into().token())?;
        Ok(())
    }

    /// Ask the supply to ramp to the setpoint, retrying while it answers `NOT_RDY`.
    pub fn ramp_to_setpoint(&mut self, budget: &PollBudget) -> Result<u32, T::Error> {
        self.request_ramp(RAMP_TO_SETPOINT, budget)
    }

    /// Ask the supply to ramp to zero field, retrying while it answers `NOT_RDY`.
    pub fn ramp_to_zero(&mut self, budget: &PollBudget) -> Result<u32, T::Error> {
        self.request_ramp(RAMP_TO_ZERO, budget)
    }

    fn request_ramp(&mut self, noun: &str, budget: &PollBudget) -> Result<u32, T::Error> {
        let transport = &mut self.transport;
        poll_until(&mut self.clock, budget, || {
            let ack = oxford::action(transport, noun)?;
            if ack == NOT_READY {
                Ok(PollState::Pending(ack))
            } else {
                Ok(PollState::Done)
            }
        })
    }

    /// Stop a ramp where it is.
    pub fn hold(&mut self) -> Result<(), T::Error> {
        oxford::action(&mut self.transport, HOLD)?;
        Ok(())
    }

    pub fn is_holding(&mut self) -> Result<bool, T::Error> {
        Ok(self.action_status()? == "HOLD")
    }

    /// Poll until the supply reports `HOLD`.
    pub fn wait_until_holding(&mut self, budget: &PollBudget) -> Result<u32, T::Error> {
        let transport = &mut self.transport;
        poll_until(&mut self.clock, budget, || {
            let status = oxford::read_token(transport, ACTION)?;
            if status == "HOLD" {
                Ok(PollState::Done)
            } else {
                Ok(PollState::Pending(status))
            }
        })
    }

    pub fn clamp(&mut self) -> Result<(), T::Error> {
        oxford::action(&mut self.transport, CLAMP)?;
        Ok(())
    }

    /// Return the magnet temperature in kelvin.
    pub fn magnet_temperature(&mut self) -> Result<f64, T::Error> {
        oxford::read_value(&mut self.transport, MAGNET_TEMPERATURE, "K")
    }

    /// Return the first pulse tube stage temperature in kelvin.
    pub fn pt1_temperature(&mut self) -> Result<f64, T::Error> {
        oxford::read_value(&mut self.transport, PT1_TEMPERATURE, "K")
    }

    /// Return the second pulse tube stage temperature in kelvin.
    pub fn pt2_temperature(&mut self) -> Result<f64, T::Error> {
        oxford::read_value(&mut self.transport, PT2_TEMPERATURE, "K")
    }

    /// Set a new field, ramp to it and wait until the supply holds. Returns the output field.
    pub fn ramp_to_field(&mut self, tesla: f64, config: &PersistentModeConfig) -> Result<f64, T::Error> {
        self.set_field_setpoint(tesla)?;
        self.ramp_to_setpoint(&config.ramp)?;
        self.wait_until_holding(&config.hold)?;
        self.magnetic_field()
    }

    /// Leave the field trapped in the magnet and ramp the leads down.
    ///
    /// Switch heater off, wait for the switch to cool, ramp to zero and wait for HOLD. Returns the
    /// persistent field.
    pub fn enter_persistent_mode(&mut self, config: &PersistentModeConfig) -> Result<f64, T::Error> {
        self.set_switch_heater(State::Off)?;
        log::info!("switch heater off, waiting {} s", config.heater_delay.to_secs());
        self.clock.sleep(config.heater_delay);
        self.ramp_to_zero(&config.ramp)?;
        self.wait_until_holding(&config.hold)?;
        let field = self.persistent_field()?;
        log::info!("persistent at {field} T");
        Ok(field)
    }

    /// Bring the leads back up to the trapped field, then open the switch.
    ///
    /// Ramp to the persistent field, wait for HOLD, switch heater on and wait for the switch to
    /// warm. Returns the output field.
    pub fn leave_persistent_mode(&mut self, config: &PersistentModeConfig) -> Result<f64, T::Error> {
        let trapped = self.persistent_field()?;
        self.set_field_setpoint(trapped)?;
        self.ramp_to_setpoint(&config.ramp)?;
        self.wait_until_holding(&config.hold)?;
        self.set_switch_heater(State::On)?;
        log::info!("switch heater on, waiting {} s", config.heater_delay.to_secs());
        self.clock.sleep(config.heater_delay);
        self.magnetic_field()
    }

    /// Release the transport's stream.
    pub fn close(&mut self) -> Result<(), T::Error> {
        self.transport.close()
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}
