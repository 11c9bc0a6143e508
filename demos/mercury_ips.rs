use std::env;

use inquire::{Select, Text};
use labdrivers::{
    dispatch::{TransportMode, std_tables::MERCURY},
    endpoint::Endpoint,
    instruments::mercury_ips::MercuryIps,
    settle::PollBudget,
};
use strum::IntoEnumIterator;

// Configuration constants - adjust these for your setup
const FIELD_SETPOINT_T: f64 = 0.5;
const FIELD_RAMP_RATE_T_PER_MIN: f64 = 0.1;
// Ramping half a tesla at 0.1 T/min takes five minutes, leave some slack.
const RAMP_TIMEOUT_S: u64 = 600;
const RAMP_POLL_INTERVAL_S: u64 = 5;

fn main() {
    env_logger::init();

    // Get the address from the command line or ask for it
    let address = env::args().nth(1).unwrap_or_else(|| {
        Text::new("Magnet power supply address or serial port:")
            .prompt()
            .expect("Failed to read address")
    });

    let modes: Vec<String> = MERCURY.modes().map(|mode| mode.to_string()).collect();
    let mode = Select::new("Select a transport:", modes)
        .prompt()
        .expect("Failed to select transport");

    let endpoint = match mode.parse::<TransportMode>() {
        Ok(TransportMode::Visa) => Endpoint::builder().with_resource(&address),
        _ => Endpoint::builder().with_address(&address),
    }
    .build()
    .expect("Invalid endpoint");

    println!("Using {mode} transport to {address}");
    println!(
        "Available transports: {:?}",
        TransportMode::iter().collect::<Vec<_>>()
    );

    let mut ips = MercuryIps::open(&MERCURY, &mode, &endpoint).unwrap();

    println!("Magnetic field: {} T", ips.magnetic_field().unwrap());
    println!("Persistent field: {} T", ips.persistent_field().unwrap());
    println!("Switch heater: {}", ips.switch_heater().unwrap());
    println!("Magnet temperature: {} K", ips.magnet_temperature().unwrap());

    ips.set_field_ramp_rate(FIELD_RAMP_RATE_T_PER_MIN).unwrap();
    println!("Set ramp rate to {FIELD_RAMP_RATE_T_PER_MIN} T/min");

    let setpoint = ips.set_field_setpoint(FIELD_SETPOINT_T).unwrap();
    println!("Field setpoint now reads {setpoint} T");

    // Start the ramp, then wait for the supply to report HOLD
    let budget = PollBudget::new(fugit::MillisDurationU64::secs(RAMP_POLL_INTERVAL_S))
        .with_timeout(fugit::MillisDurationU64::secs(RAMP_TIMEOUT_S));
    ips.ramp_to_setpoint(&budget).unwrap();
    ips.wait_until_holding(&budget).unwrap();
    println!("Holding at {} T", ips.magnetic_field().unwrap());

    ips.close().unwrap();
}
