use std::sync::{
  atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering},
  Arc, Mutex,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{scheduling::clock::Clock, structure::time::Time, sync::event::ManualResetEvent};

/// Tracks in-flight work and the finalize time for one logical scope
/// (a pipeline or subpipeline).
///
/// Every scheduled work item and every synchronously executed action enters
/// the context before running and exits afterwards; the `empty` event is set
/// exactly when nothing is in flight, which is what quiescence waits on.
pub struct SchedulerContext {
  clock: Mutex<Option<Arc<Clock>>>,
  started: AtomicBool,
  stopped: AtomicBool,
  finalize_time_ticks: AtomicI64,
  in_flight: AtomicI32,
  empty: ManualResetEvent,
}

impl Default for SchedulerContext {
  fn default() -> Self {
    Self::new()
  }
}

impl SchedulerContext {
  pub fn new() -> SchedulerContext {
    SchedulerContext {
      clock: Mutex::new(None),
      started: AtomicBool::new(false),
      stopped: AtomicBool::new(false),
      finalize_time_ticks: AtomicI64::new(Time::MAX.ticks()),
      in_flight: AtomicI32::new(0),
      empty: ManualResetEvent::new(true),
    }
  }

  /// Starts the context, recording the clock it schedules against.
  pub fn start(&self, clock: Arc<Clock>) {
    *self.clock.lock().unwrap() = Some(clock);
    self.stopped.store(false, Ordering::Release);
    self.started.store(true, Ordering::Release);
  }

  /// Stops the context. Subsequent enqueues on it are dropped.
  pub fn stop(&self) {
    self.started.store(false, Ordering::Release);
    self.stopped.store(true, Ordering::Release);
  }

  pub fn is_started(&self) -> bool {
    self.started.load(Ordering::Acquire)
  }

  pub fn is_stopped(&self) -> bool {
    self.stopped.load(Ordering::Acquire)
  }

  pub fn clock(&self) -> Option<Arc<Clock>> {
    self.clock.lock().unwrap().clone()
  }

  /// The final scheduling time, once known. Work items past this point are
  /// dropped instead of executed.
  pub fn finalize_time(&self) -> Time {
    Time::from_ticks(self.finalize_time_ticks.load(Ordering::Acquire))
  }

  pub fn set_finalize_time(&self, t: Time) {
    trace!("SchedulerContext finalize time set to {t}");
    self.finalize_time_ticks.store(t.ticks(), Ordering::Release);
  }

  pub fn enter(&self) {
    if self.in_flight.fetch_add(1, Ordering::AcqRel) == 0 {
      self.empty.reset();
    }
  }

  pub fn exit(&self) {
    let prev = self.in_flight.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(prev > 0, "SchedulerContext::exit without matching enter");
    if prev == 1 {
      self.empty.set();
    }
  }

  pub fn in_flight(&self) -> i32 {
    self.in_flight.load(Ordering::Acquire)
  }

  /// Blocks until nothing is in flight on this context.
  pub fn wait_empty(&self) {
    self.empty.wait();
  }
}
