use serde::{Deserialize, Serialize};

use crate::{
  scheduling::clock::Clock,
  structure::time::{Time, TimeInterval},
};

/// Caller-facing description of how virtual time should run for one
/// pipeline execution.
///
/// The pipeline converts this to a `Clock`: virtual origin at the left edge
/// of the interval, dilation 1.0 when the replay clock is enforced
/// (deliveries wait for their originating times) or 0 for
/// as-fast-as-possible execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayDescriptor {
  pub interval: TimeInterval,
  /// Whether persisted streams should be keyed by originating time rather
  /// than creation time. Stores honor this; the core carries it through.
  pub use_originating_time: bool,
  /// When true, messages are delivered no earlier than their originating
  /// times dictate under the clock.
  pub enforce_replay_clock: bool,
}

impl ReplayDescriptor {
  /// Live execution: virtual time starts now and tracks real time.
  pub fn real_time() -> ReplayDescriptor {
    ReplayDescriptor {
      interval: TimeInterval::starting_at(Time::now()),
      use_originating_time: true,
      enforce_replay_clock: true,
    }
  }

  /// Replay everything as fast as possible.
  pub fn replay_all() -> ReplayDescriptor {
    ReplayDescriptor {
      interval: TimeInterval::EVERYTHING,
      use_originating_time: true,
      enforce_replay_clock: false,
    }
  }

  /// Replay `interval`, pacing deliveries against real time.
  pub fn replay_paced(interval: TimeInterval) -> ReplayDescriptor {
    ReplayDescriptor {
      interval,
      use_originating_time: true,
      enforce_replay_clock: true,
    }
  }

  pub(crate) fn to_clock(&self) -> Clock {
    let origin = if self.interval.left == Time::MIN {
      Time::now()
    } else {
      self.interval.left
    };
    if self.enforce_replay_clock {
      Clock::real_time(origin)
    } else {
      Clock::frozen(origin)
    }
  }

  pub(crate) fn delay_future_items_until_due(&self) -> bool {
    self.enforce_replay_clock
  }
}

impl Default for ReplayDescriptor {
  fn default() -> ReplayDescriptor {
    ReplayDescriptor::real_time()
  }
}
