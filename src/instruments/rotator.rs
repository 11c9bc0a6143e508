//! Motorised rotation stage driven through the vendor's motion control library.
//!
//! The library is not a command/response link: every call takes or fills fixed `i32` arrays and
//! returns a status code. [`MotionLibrary`] mirrors those calls so the stage logic can run over
//! the real bindings or a mock.

use fugit::MillisDurationU64;
use crate::{
    command::Limits,
    error::{Error, Result},
    scaling::PulseScale,
    settle::{Clock, PollBudget, PollState, SystemClock, poll_until},
};

pub const DEFAULT_AXIS: i32 = 1;
/// Serial port number passed to [`MotionLibrary::open`]; 0 selects USB.
pub const USB_PORT: i32 = 0;
pub const MOVE_POLL_INTERVAL: MillisDurationU64 = MillisDurationU64::secs(1);

const ABSOLUTE_ANGLE: Limits = Limits::real(0.0, 360.0);
const RELATIVE_ANGLE: Limits = Limits::real(-360.0, 360.0);

/// A non-zero status code returned by the motion library.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("motion library call failed with status {0}")]
pub struct LibraryError(pub i32);

impl embedded_io::Error for LibraryError {
    fn kind(&self) -> embedded_io::ErrorKind {
        embedded_io::ErrorKind::Other
    }
}

impl LibraryError {
    /// Map a raw status code, 0 meaning success.
    pub fn check(code: i32) -> core::result::Result<(), Self> {
        match code {
            0 => Ok(()),
            code => Err(LibraryError(code)),
        }
    }
}

/// The calls of the motion control library used by [`Rotator`].
pub trait MotionLibrary {
    type Error: embedded_io::Error;

    fn open(&mut self, port: i32) -> core::result::Result<(), Self::Error>;
    fn close(&mut self) -> core::result::Result<(), Self::Error>;
    /// Positions of all four axes in pulses.
    fn axes_pulses(&mut self) -> core::result::Result<[i32; 4], Self::Error>;
    /// Non-zero while the axis is moving.
    fn axis_status(&mut self, axis: i32) -> core::result::Result<i32, Self::Error>;
    /// Move `axis` by `pulses` relative to where it is.
    fn move_axis_pulses(&mut self, axis: i32, pulses: i32) -> core::result::Result<(), Self::Error>;
    fn axis_acceleration(&mut self, axis: i32) -> core::result::Result<i32, Self::Error>;
    fn axis_velocity(&mut self, axis: i32) -> core::result::Result<i32, Self::Error>;
    fn set_axis_velocity(&mut self, axis: i32, velocity: i32) -> core::result::Result<(), Self::Error>;
}

/// Position and motion state of the stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotatorStatus {
    /// Degrees, rounded to 0.01.
    pub angle: f64,
    pub moving: bool,
}

pub struct Rotator<L: MotionLibrary, K: Clock = SystemClock> {
    library: L,
    clock: K,
    scale: PulseScale,
    axis: i32,
}

impl<L: MotionLibrary> Rotator<L> {
    /// Reopen the library on `port`.
    pub fn connect(library: L, port: i32) -> Result<Self, L::Error> {
        Self::connect_with_clock(library, port, SystemClock::default())
    }
}

impl<L: MotionLibrary, K: Clock> Rotator<L, K> {
    pub fn connect_with_clock(mut library: L, port: i32, clock: K) -> Result<Self, L::Error> {
        // A handle left open by a previous session makes open fail.
        library.close().map_err(Error::Transport)?;
        library.open(port).map_err(Error::Transport)?;
        let mut rotator = Self {
            library,
            clock,
            scale: PulseScale::default(),
            axis: DEFAULT_AXIS,
        };
        let status = rotator.status()?;
        log::info!("rotator connected at {} deg", status.angle);
        Ok(rotator)
    }

    pub fn with_axis(mut self, axis: i32) -> Self {
        self.axis = axis;
        self
    }

    pub fn with_scale(mut self, scale: PulseScale) -> Self {
        self.scale = scale;
        self
    }

    /// Unrounded position in degrees.
    pub fn angle(&mut self) -> Result<f64, L::Error> {
        let pulses = self.pulses()?;
        Ok(self.scale.pulses_to_degrees(pulses))
    }

    pub fn status(&mut self) -> Result<RotatorStatus, L::Error> {
        read_status(&mut self.library, self.scale, self.axis)
    }

    /// Move to `degrees` (0 to 360) and wait until the stage stops.
    pub fn go_to_angle(&mut self, degrees: f64, budget: &PollBudget) -> Result<RotatorStatus, L::Error> {
        ABSOLUTE_ANGLE.check("angle", degrees.into())?;
        let current = self.pulses()?;
        let target = self.scale.degrees_to_pulses(degrees);
        let change = target.checked_sub(current).ok_or_else(|| {
            Error::InvalidResponse(format!("cannot move from {current} to {target} pulses"))
        })?;
        self.move_pulses(change)?;
        let (library, scale, axis) = (&mut self.library, self.scale, self.axis);
        let mut last = None;
        poll_until(&mut self.clock, budget, || {
            let status = read_status(library, scale, axis)?;
            last = Some(status);
            match status.moving {
                true => {
                    log::info!("at {} deg, moving to {degrees} deg", status.angle);
                    Ok(PollState::Pending(format!("{} deg", status.angle)))
                }
                false => Ok(PollState::Done),
            }
        })?;
        let status = match last {
            Some(status) => status,
            None => self.status()?,
        };
        log::info!("sitting at {} deg", status.angle);
        Ok(status)
    }

    /// Start a move of `degrees` (-360 to 360) relative to the present position without waiting.
    pub fn move_by(&mut self, degrees: f64) -> Result<(), L::Error> {
        RELATIVE_ANGLE.check("angle", degrees.into())?;
        let change = self.scale.degrees_to_pulses(degrees);
        self.move_pulses(change)
    }

    pub fn acceleration(&mut self) -> Result<i32, L::Error> {
        self.library
            .axis_acceleration(self.axis)
            .map_err(Error::Transport)
    }

    pub fn speed(&mut self) -> Result<i32, L::Error> {
        self.library
            .axis_velocity(self.axis)
            .map_err(Error::Transport)
    }

    pub fn set_speed(&mut self, speed: i32) -> Result<(), L::Error> {
        self.library
            .set_axis_velocity(self.axis, speed)
            .map_err(Error::Transport)
    }

    pub fn close(&mut self) -> Result<(), L::Error> {
        self.library.close().map_err(Error::Transport)
    }

    pub fn into_inner(self) -> L {
        self.library
    }

    fn pulses(&mut self) -> Result<i32, L::Error> {
        axis_pulses(&mut self.library, self.axis)
    }

    fn move_pulses(&mut self, pulses: i32) -> Result<(), L::Error> {
        log::debug!("moving axis {} by {pulses} pulses", self.axis);
        self.library
            .move_axis_pulses(self.axis, pulses)
            .map_err(Error::Transport)
    }
}

fn axis_pulses<L: MotionLibrary>(library: &mut L, axis: i32) -> Result<i32, L::Error> {
    let pulses = library.axes_pulses().map_err(Error::Transport)?;
    usize::try_from(axis - 1)
        .ok()
        .and_then(|index| pulses.get(index).copied())
        .ok_or_else(|| Error::InvalidResponse(format!("no axis {axis} in {pulses:?}")))
}

fn read_status<L: MotionLibrary>(
    library: &mut L,
    scale: PulseScale,
    axis: i32,
) -> Result<RotatorStatus, L::Error> {
    let pulses = axis_pulses(library, axis)?;
    let moving = library
        .axis_status(axis)
        .map_err(Error::Transport)?;
    Ok(RotatorStatus {
        angle: scale.pulses_to_rounded_degrees(pulses),
        moving: moving != 0,
    })
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::VecDeque, rc::Rc};

    use super::*;
    use crate::mock_clock::ManualClock;

    #[derive(Default)]
    struct Stage {
        open: bool,
        pulses: i32,
        /// Remaining status polls that report moving after a move.
        moving_polls: VecDeque<i32>,
        moves: Vec<i32>,
        velocity: i32,
        fail_status: Option<i32>,
    }

    #[derive(Clone, Default)]
    struct MockLibrary(Rc<RefCell<Stage>>);

    impl MotionLibrary for MockLibrary {
        type Error = LibraryError;

        fn open(&mut self, port: i32) -> core::result::Result<(), LibraryError> {
            let mut stage = self.0.borrow_mut();
            if stage.open {
                return Err(LibraryError(-1));
            }
            stage.open = port == USB_PORT;
            LibraryError::check(if stage.open { 0 } else { -2 })
        }

        fn close(&mut self) -> core::result::Result<(), LibraryError> {
            self.0.borrow_mut().open = false;
            Ok(())
        }

        fn axes_pulses(&mut self) -> core::result::Result<[i32; 4], LibraryError> {
            Ok([self.0.borrow().pulses, 7, 0, 0])
        }

        fn axis_status(&mut self, _axis: i32) -> core::result::Result<i32, LibraryError> {
            let mut stage = self.0.borrow_mut();
            if let Some(code) = stage.fail_status {
                return Err(LibraryError(code));
            }
            Ok(stage.moving_polls.pop_front().unwrap_or(0))
        }

        fn move_axis_pulses(&mut self, _axis: i32, pulses: i32) -> core::result::Result<(), LibraryError> {
            let mut stage = self.0.borrow_mut();
            stage.pulses += pulses;
            stage.moves.push(pulses);
            Ok(())
        }

        fn axis_acceleration(&mut self, _axis: i32) -> core::result::Result<i32, LibraryError> {
            Ok(2000)
        }

        fn axis_velocity(&mut self, _axis: i32) -> core::result::Result<i32, LibraryError> {
            Ok(self.0.borrow().velocity)
        }

        fn set_axis_velocity(&mut self, _axis: i32, velocity: i32) -> core::result::Result<(), LibraryError> {
            self.0.borrow_mut().velocity = velocity;
            Ok(())
        }
    }

    fn rotator(pulses: i32) -> (MockLibrary, ManualClock, Rotator<MockLibrary, ManualClock>) {
        let library = MockLibrary::default();
        library.0.borrow_mut().open = true;
        library.0.borrow_mut().pulses = pulses;
        let clock = ManualClock::new();
        let rotator = Rotator::connect_with_clock(library.clone(), USB_PORT, clock.clone()).unwrap();
        (library, clock, rotator)
    }

    fn budget() -> PollBudget {
        PollBudget::new(MOVE_POLL_INTERVAL)
    }

    #[test]
    fn connect_reopens_the_library() {
        let (library, _, _) = rotator(0);
        assert!(library.0.borrow().open);
        assert!(matches!(
            Rotator::connect_with_clock(MockLibrary::default(), 3, ManualClock::new()),
            Err(Error::Transport(LibraryError(-2)))
        ));
    }

    #[test]
    fn go_to_angle_moves_by_the_difference_and_waits() {
        let (library, clock, mut rotator) = rotator(12501);
        library.0.borrow_mut().moving_polls = [1, 1].into();
        let status = rotator.go_to_angle(180.0, &budget()).unwrap();
        assert_eq!(status, RotatorStatus { angle: 180.0, moving: false });
        assert_eq!(library.0.borrow().moves, [12501]);
        assert_eq!(clock.elapsed_ms(), 2_000);
    }

    #[test]
    fn go_to_angle_rejects_out_of_range() {
        let (library, _, mut rotator) = rotator(0);
        for degrees in [-0.5, 360.5, f64::NAN] {
            assert!(rotator.go_to_angle(degrees, &budget()).unwrap_err().is_local());
        }
        assert!(library.0.borrow().moves.is_empty());
    }

    #[test]
    fn go_to_angle_rejects_unreachable_position() {
        let (library, _, mut rotator) = rotator(i32::MIN);
        assert!(matches!(
            rotator.go_to_angle(360.0, &budget()),
            Err(Error::InvalidResponse(_))
        ));
        assert!(library.0.borrow().moves.is_empty());
    }

    #[test]
    fn go_to_angle_deadline() {
        let (library, _, mut rotator) = rotator(0);
        library.0.borrow_mut().moving_polls = [1; 10].into();
        let budget = budget().with_timeout(MillisDurationU64::secs(3));
        assert!(matches!(
            rotator.go_to_angle(90.0, &budget),
            Err(Error::DeadlineExceeded { attempts: 4, .. })
        ));
    }

    #[test]
    fn status_failures_are_not_retried() {
        let (library, clock, mut rotator) = rotator(0);
        library.0.borrow_mut().fail_status = Some(5);
        assert!(matches!(
            rotator.go_to_angle(10.0, &budget()),
            Err(Error::Transport(LibraryError(5)))
        ));
        assert_eq!(clock.sleeps(), 0);
    }

    #[test]
    fn move_by_is_relative() {
        let (library, _, mut rotator) = rotator(25002);
        rotator.move_by(-90.0).unwrap();
        rotator.move_by(360.0).unwrap();
        assert!(rotator.move_by(400.0).unwrap_err().is_local());
        assert_eq!(library.0.borrow().moves, [-12501, 50004]);
        assert_eq!(rotator.angle().unwrap(), 450.0);
    }

    #[test]
    fn status_is_rounded() {
        let (_, _, mut rotator) = rotator(139);
        assert_eq!(
            rotator.status().unwrap(),
            RotatorStatus { angle: 1.0, moving: false }
        );
        assert!((rotator.angle().unwrap() - 1.00072).abs() < 1e-5);
    }

    #[test]
    fn speed_and_acceleration() {
        let (_, _, mut rotator) = rotator(0);
        rotator.set_speed(1500).unwrap();
        assert_eq!(rotator.speed().unwrap(), 1500);
        assert_eq!(rotator.acceleration().unwrap(), 2000);
    }

    #[test]
    fn second_axis() {
        let (_, _, rotator) = rotator(0);
        let mut rotator = rotator.with_axis(2);
        assert_eq!(rotator.angle().unwrap(), 7.0 * 360.0 / 50004.0);
        let mut rotator = rotator.with_axis(5);
        assert!(matches!(rotator.angle(), Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn status_codes() {
        assert_eq!(LibraryError::check(0), Ok(()));
        assert_eq!(LibraryError::check(3), Err(LibraryError(3)));
    }
}
