//! Waiting for slow hardware.
//!
//! Two strategies are provided:
//!
//! * [`poll_until`] asks the device for its status at a fixed interval until it reports a
//!   terminal state (a ramp finished, an event register cleared).
//! * [`settle`] keeps the last `N` readings of a drifting quantity in a [`SettleWindow`] and stops
//!   once their mean is close enough to a target and their variance small enough.
//!
//! Both loops are bounded by a [`PollBudget`]: an optional timeout and an optional
//! [`CancelToken`] which another thread may trigger. A failed query is never retried, the
//! error is returned straight away.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use heapless::Deque;

use crate::error::{Error, Result};

pub type Instant = fugit::TimerInstantU64<1000>;
pub type Duration = fugit::MillisDurationU64;

/// Source of time and blocking delays.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&mut self, duration: Duration);
}

/// Wall clock time via `std::thread::sleep`.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: std::time::Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        let elapsed = self.origin.elapsed().as_millis();
        Instant::from_ticks(u64::try_from(elapsed).unwrap_or(u64::MAX))
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(std::time::Duration::from_millis(duration.to_millis()));
    }
}

/// Shared flag used to abandon a wait from elsewhere.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How often to poll and when to give up.
#[derive(Debug, Clone)]
pub struct PollBudget {
    pub interval: Duration,
    /// `None` waits for as long as it takes.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl PollBudget {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
            cancel: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

/// Outcome of one status query.
#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
    /// Not there yet. Carries the status that was observed.
    Pending(String),
    Done,
    /// The device reported a condition it will not recover from.
    Fault(String),
}

/// Call `poll` every `budget.interval` until it reports [`PollState::Done`].
///
/// Returns the number of attempts made. Errors from `poll` end the loop immediately.
pub fn poll_until<E, K, F>(clock: &mut K, budget: &PollBudget, mut poll: F) -> Result<u32, E>
where
    E: embedded_io::Error,
    K: Clock,
    F: FnMut() -> Result<PollState, E>,
{
    let deadline = budget.timeout.map(|timeout| clock.now() + timeout);
    let mut attempts = 0;
    loop {
        if budget.is_cancelled() {
            log::debug!("poll cancelled after {attempts} attempts");
            return Err(Error::Cancelled { attempts });
        }
        attempts += 1;
        let last_status = match poll()? {
            PollState::Done => {
                log::info!("done after {attempts} polls");
                return Ok(attempts);
            }
            PollState::Fault(fault) => return Err(Error::DeviceFault(fault)),
            PollState::Pending(status) => status,
        };
        log::trace!("poll {attempts}: {last_status}");
        if let Some(deadline) = deadline
            && clock.now() + budget.interval > deadline
        {
            return Err(Error::DeadlineExceeded {
                attempts,
                last_status: Some(last_status),
            });
        }
        clock.sleep(budget.interval);
    }
}

/// Relative settling tolerances around a target value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettleCriteria {
    pub target: f64,
    /// `|mean - target|` must be below `mean_tolerance * |target|`.
    pub mean_tolerance: f64,
    /// The window's population variance must be below `variance_tolerance * |target|`.
    pub variance_tolerance: f64,
}

impl SettleCriteria {
    pub fn new(target: f64, mean_tolerance: f64, variance_tolerance: f64) -> Self {
        Self {
            target,
            mean_tolerance,
            variance_tolerance,
        }
    }
}

/// The last `N` readings.
#[derive(Debug, Clone, Default)]
pub struct SettleWindow<const N: usize> {
    samples: Deque<f64, N>,
}

impl<const N: usize> SettleWindow<N> {
    pub fn new() -> Self {
        Self {
            samples: Deque::new(),
        }
    }

    /// Add a reading, evicting the oldest one once the window is full.
    pub fn push(&mut self, sample: f64) {
        if self.samples.is_full() {
            self.samples.pop_front();
        }
        // Room was made above.
        let _ = self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.samples.is_full()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Population variance.
    pub fn variance(&self) -> Option<f64> {
        let mean = self.mean()?;
        let squares: f64 = self.samples.iter().map(|x| (x - mean).powi(2)).sum();
        Some(squares / self.samples.len() as f64)
    }

    /// Only a full window can be settled.
    pub fn is_settled(&self, criteria: &SettleCriteria) -> bool {
        let (Some(mean), Some(variance)) = (self.mean(), self.variance()) else {
            return false;
        };
        let scale = criteria.target.abs();
        self.is_full()
            && (mean - criteria.target).abs() < criteria.mean_tolerance * scale
            && variance < criteria.variance_tolerance * scale
    }
}

/// Read `sample` every `budget.interval` until the last `N` readings satisfy `criteria`.
///
/// A partly filled window never settles, so at least `N` readings are taken even when the first
/// one is already on target. Returns the settled mean.
pub fn settle<const N: usize, E, K, F>(
    clock: &mut K,
    budget: &PollBudget,
    criteria: &SettleCriteria,
    mut sample: F,
) -> Result<f64, E>
where
    E: embedded_io::Error,
    K: Clock,
    F: FnMut() -> Result<f64, E>,
{
    let mut window = SettleWindow::<N>::new();
    let mut mean = f64::NAN;
    poll_until(clock, budget, || {
        window.push(sample()?);
        if window.is_settled(criteria) {
            mean = window.mean().unwrap_or(f64::NAN);
            return Ok(PollState::Done);
        }
        Ok(PollState::Pending(format!(
            "{} samples, mean {:?}",
            window.len(),
            window.mean()
        )))
    })?;
    log::info!("settled at {mean} (target {})", criteria.target);
    Ok(mean)
}
