// Virtual time instants and spans.
//
// The whole runtime schedules against these, not against the OS clock.
// The unit is a "tick" of 100 nanoseconds, counted from the Unix epoch,
// which is also the unit used by the envelope wire layout.

use std::{
  fmt,
  ops::{Add, AddAssign, Neg, Sub, SubAssign},
  time::SystemTime,
};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use speedy::{Context, Readable, Reader, Writable, Writer};

/// Ticks per second (tick = 100 ns).
pub const TICKS_PER_SECOND: i64 = 10_000_000;
const TICKS_PER_MILLISECOND: i64 = TICKS_PER_SECOND / 1_000;
const TICKS_PER_MICROSECOND: i64 = TICKS_PER_SECOND / 1_000_000;
const NANOS_PER_TICK: i64 = 100;

/// A point in virtual time.
///
/// `Time::MAX` doubles as "never" / "infinite": it is the completion time
/// reported by non-finite sources and the finalize time of a pipeline whose
/// end is not yet known.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Time {
  ticks: i64,
}

impl Time {
  pub const MIN: Time = Time { ticks: i64::MIN };
  pub const MAX: Time = Time { ticks: i64::MAX };
  pub const UNIX_EPOCH: Time = Time { ticks: 0 };

  pub const fn from_ticks(ticks: i64) -> Time {
    Time { ticks }
  }

  pub const fn ticks(&self) -> i64 {
    self.ticks
  }

  /// Current wall-clock time. Used only to seed clocks and stamp creation
  /// times; scheduling decisions always go through a `Clock`.
  pub fn now() -> Time {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
      Ok(d) => Time {
        ticks: (d.as_nanos() / NANOS_PER_TICK as u128) as i64,
      },
      // Clock set before 1970. Saturate rather than panic.
      Err(_) => Time::UNIX_EPOCH,
    }
  }

  pub fn saturating_add(self, d: Duration) -> Time {
    Time {
      ticks: self.ticks.saturating_add(d.ticks),
    }
  }

  pub fn saturating_sub(self, d: Duration) -> Time {
    Time {
      ticks: self.ticks.saturating_sub(d.ticks),
    }
  }

  pub fn to_chrono(&self) -> Option<DateTime<Utc>> {
    let secs = self.ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = (self.ticks.rem_euclid(TICKS_PER_SECOND) * NANOS_PER_TICK) as u32;
    Utc.timestamp_opt(secs, nanos).single()
  }

  pub fn from_chrono(dt: &DateTime<Utc>) -> Time {
    let secs = dt.timestamp();
    let sub_ticks = (dt.timestamp_subsec_nanos() as i64) / NANOS_PER_TICK;
    Time {
      ticks: secs
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(sub_ticks),
    }
  }
}

impl fmt::Display for Time {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match *self {
      Time::MAX => write!(f, "Time::MAX"),
      Time::MIN => write!(f, "Time::MIN"),
      t => match t.to_chrono() {
        Some(dt) => write!(
          f,
          "{}.{:07}Z",
          dt.format("%Y-%m-%dT%H:%M:%S"),
          dt.timestamp_subsec_nanos() / NANOS_PER_TICK as u32
        ),
        None => write!(f, "Time({} ticks)", t.ticks),
      },
    }
  }
}

impl Add<Duration> for Time {
  type Output = Time;
  fn add(self, d: Duration) -> Time {
    self.saturating_add(d)
  }
}

impl AddAssign<Duration> for Time {
  fn add_assign(&mut self, d: Duration) {
    *self = *self + d;
  }
}

impl Sub<Duration> for Time {
  type Output = Time;
  fn sub(self, d: Duration) -> Time {
    self.saturating_sub(d)
  }
}

impl Sub<Time> for Time {
  type Output = Duration;
  fn sub(self, other: Time) -> Duration {
    Duration {
      ticks: self.ticks.saturating_sub(other.ticks),
    }
  }
}

impl<'a, C: Context> Readable<'a, C> for Time {
  fn read_from<R: Reader<'a, C>>(reader: &mut R) -> Result<Self, C::Error> {
    Ok(Time::from_ticks(i64::read_from(reader)?))
  }
}

impl<C: Context> Writable<C> for Time {
  fn write_to<W: ?Sized + Writer<C>>(&self, writer: &mut W) -> Result<(), C::Error> {
    self.ticks.write_to(writer)
  }
}

// ----------------------------------------------------------------------------

/// A span of virtual time. May be negative.
#[derive(
  Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Duration {
  ticks: i64,
}

impl Duration {
  pub const ZERO: Duration = Duration { ticks: 0 };
  pub const MAX: Duration = Duration { ticks: i64::MAX };

  pub const fn from_ticks(ticks: i64) -> Duration {
    Duration { ticks }
  }

  pub const fn from_secs(secs: i64) -> Duration {
    Duration {
      ticks: secs * TICKS_PER_SECOND,
    }
  }

  pub const fn from_millis(millis: i64) -> Duration {
    Duration {
      ticks: millis * TICKS_PER_MILLISECOND,
    }
  }

  pub const fn from_micros(micros: i64) -> Duration {
    Duration {
      ticks: micros * TICKS_PER_MICROSECOND,
    }
  }

  pub const fn from_nanos(nanos: i64) -> Duration {
    Duration {
      ticks: nanos / NANOS_PER_TICK,
    }
  }

  pub const fn ticks(&self) -> i64 {
    self.ticks
  }

  pub const fn is_negative(&self) -> bool {
    self.ticks < 0
  }

  pub fn as_secs_f64(&self) -> f64 {
    self.ticks as f64 / TICKS_PER_SECOND as f64
  }

  /// Conversion to `std::time::Duration`; `None` for negative spans.
  pub fn to_std(&self) -> Option<std::time::Duration> {
    if self.ticks < 0 {
      None
    } else {
      Some(std::time::Duration::from_nanos(
        (self.ticks as u64).saturating_mul(NANOS_PER_TICK as u64),
      ))
    }
  }

  pub fn from_std(d: std::time::Duration) -> Duration {
    Duration {
      ticks: (d.as_nanos() / NANOS_PER_TICK as u128).min(i64::MAX as u128) as i64,
    }
  }
}

impl fmt::Display for Duration {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:.7}s", self.as_secs_f64())
  }
}

impl Add for Duration {
  type Output = Duration;
  fn add(self, other: Duration) -> Duration {
    Duration {
      ticks: self.ticks.saturating_add(other.ticks),
    }
  }
}

impl Sub for Duration {
  type Output = Duration;
  fn sub(self, other: Duration) -> Duration {
    Duration {
      ticks: self.ticks.saturating_sub(other.ticks),
    }
  }
}

impl SubAssign for Duration {
  fn sub_assign(&mut self, other: Duration) {
    *self = *self - other;
  }
}

impl Neg for Duration {
  type Output = Duration;
  fn neg(self) -> Duration {
    Duration {
      ticks: self.ticks.saturating_neg(),
    }
  }
}

impl<'a, C: Context> Readable<'a, C> for Duration {
  fn read_from<R: Reader<'a, C>>(reader: &mut R) -> Result<Self, C::Error> {
    Ok(Duration::from_ticks(i64::read_from(reader)?))
  }
}

impl<C: Context> Writable<C> for Duration {
  fn write_to<W: ?Sized + Writer<C>>(&self, writer: &mut W) -> Result<(), C::Error> {
    self.ticks.write_to(writer)
  }
}

// ----------------------------------------------------------------------------

/// A closed interval `[left, right]` of virtual time, as used by replay
/// descriptors.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInterval {
  pub left: Time,
  pub right: Time,
}

impl TimeInterval {
  pub const EVERYTHING: TimeInterval = TimeInterval {
    left: Time::MIN,
    right: Time::MAX,
  };

  pub fn new(left: Time, right: Time) -> TimeInterval {
    TimeInterval { left, right }
  }

  pub fn starting_at(left: Time) -> TimeInterval {
    TimeInterval {
      left,
      right: Time::MAX,
    }
  }

  pub fn contains(&self, t: Time) -> bool {
    self.left <= t && t <= self.right
  }

  pub fn span(&self) -> Duration {
    self.right - self.left
  }
}
