use std::{
  sync::{Condvar, Mutex},
  time::Duration as StdDuration,
};

/// A manually reset wait event over Mutex + Condvar.
///
/// Once set, the event stays set (and all waiters pass) until `reset` is
/// called. Used for the queue/context "empty" signals and for the futures
/// thread pulse.
#[derive(Debug)]
pub struct ManualResetEvent {
  state: Mutex<bool>,
  cond: Condvar,
}

impl ManualResetEvent {
  pub fn new(initially_set: bool) -> ManualResetEvent {
    ManualResetEvent {
      state: Mutex::new(initially_set),
      cond: Condvar::new(),
    }
  }

  pub fn set(&self) {
    let mut set = self.state.lock().unwrap();
    if !*set {
      *set = true;
      self.cond.notify_all();
    }
  }

  pub fn reset(&self) {
    *self.state.lock().unwrap() = false;
  }

  pub fn is_set(&self) -> bool {
    *self.state.lock().unwrap()
  }

  /// Blocks until the event is set.
  pub fn wait(&self) {
    let mut set = self.state.lock().unwrap();
    while !*set {
      set = self.cond.wait(set).unwrap();
    }
  }

  /// Blocks until the event is set or the timeout elapses.
  /// Returns `true` if the event was set.
  pub fn wait_timeout(&self, timeout: StdDuration) -> bool {
    let set = self.state.lock().unwrap();
    let (set, _timed_out) = self
      .cond
      .wait_timeout_while(set, timeout, |set| !*set)
      .unwrap();
    *set
  }
}
