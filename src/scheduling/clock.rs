use std::time::{Duration as StdDuration, Instant};

use crate::structure::time::{Duration, Time};

/// Maps virtual time to wall time with a dilation factor.
///
/// Virtual time advances at `dilation` times the rate of real time:
/// `now() = virtual_origin + (real_now - real_origin) * dilation`.
/// A dilation of 0 freezes virtual time at the origin; the scheduler is
/// created with such a clock so that everything scheduled before the
/// pipeline starts lands in the future queue.
#[derive(Debug, Clone)]
pub struct Clock {
  virtual_origin: Time,
  real_origin: Instant,
  dilation: f64,
}

impl Clock {
  pub fn new(virtual_origin: Time, dilation: f64) -> Clock {
    Clock {
      virtual_origin,
      real_origin: Instant::now(),
      dilation,
    }
  }

  /// A clock whose virtual time never advances.
  pub fn frozen(at: Time) -> Clock {
    Clock::new(at, 0.0)
  }

  /// Real-time clock starting virtual time at `origin`.
  pub fn real_time(origin: Time) -> Clock {
    Clock::new(origin, 1.0)
  }

  pub fn virtual_origin(&self) -> Time {
    self.virtual_origin
  }

  pub fn dilation(&self) -> f64 {
    self.dilation
  }

  /// Current virtual time.
  pub fn now(&self) -> Time {
    if self.dilation == 0.0 {
      self.virtual_origin
    } else {
      let elapsed = Duration::from_std(self.real_origin.elapsed());
      let dilated = Duration::from_ticks((elapsed.ticks() as f64 * self.dilation) as i64);
      self.virtual_origin + dilated
    }
  }

  /// Real span corresponding to a virtual span.
  /// `None` when virtual time is frozen (the span never elapses).
  pub fn to_real_duration(&self, virtual_span: Duration) -> Option<StdDuration> {
    if self.dilation == 0.0 {
      None
    } else {
      Duration::from_ticks((virtual_span.ticks() as f64 / self.dilation) as i64).to_std()
    }
  }

  /// How long, in real time, until virtual time `t` is reached.
  /// `Some(ZERO)` if already due, `None` if it never will be.
  pub fn real_delay_until(&self, t: Time) -> Option<StdDuration> {
    let remaining = t - self.now();
    if remaining.ticks() <= 0 {
      Some(StdDuration::ZERO)
    } else {
      self.to_real_duration(remaining)
    }
  }
}

impl Default for Clock {
  fn default() -> Clock {
    Clock::frozen(Time::MIN)
  }
}
