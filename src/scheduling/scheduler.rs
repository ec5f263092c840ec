use std::{
  cell::RefCell,
  sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, Weak,
  },
  thread,
  time::Duration as StdDuration,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::{PipelineError, PipelineResult},
  scheduling::{
    clock::Clock,
    context::SchedulerContext,
    priority_queue::{FutureWorkItemQueue, WorkItemQueue},
    work_item::{WorkItem, WorkItemCallback},
  },
  structure::time::Time,
  sync::{event::ManualResetEvent, lock::SynchronizationLock, semaphore::SimpleSemaphore},
};

/// Handler consulted when a component callback fails. Returning `true`
/// means "recovered locally, keep scheduling".
pub type ErrorHandler = Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
  /// Maximum number of concurrent worker threads.
  /// 0 means 2x the available parallelism.
  pub thread_count: usize,
  /// When false, work items whose start time lies in the virtual future are
  /// released immediately (as-fast-as-possible replay).
  pub delay_future_items_until_due: bool,
  pub name: String,
}

impl Default for SchedulerOptions {
  fn default() -> SchedulerOptions {
    SchedulerOptions {
      thread_count: 0,
      delay_future_items_until_due: true,
      name: "scheduler".to_string(),
    }
  }
}

#[derive(Debug, Default)]
struct SchedulerCounters {
  dispatched: AtomicU64,
  dropped: AtomicU64,
  local_to_global_promotions: AtomicU64,
}

/// Snapshot of scheduler counters, for diagnostics only.
#[derive(Debug, Clone, Default)]
pub struct SchedulerDiagnostics {
  pub dispatched: u64,
  pub dropped: u64,
  pub local_to_global_promotions: u64,
  pub ready_queue_len: usize,
  pub future_queue_len: usize,
}

thread_local! {
  // The lock and start time of the work item this worker thread is
  // currently executing, if any.
  static CURRENT_ITEM: RefCell<Option<(Arc<SynchronizationLock>, Time)>> =
    const { RefCell::new(None) };
  // Follow-up work item to run on this thread under the already-held lock.
  static LOCAL_ITEM: RefCell<Option<WorkItem>> = const { RefCell::new(None) };
}

/// Work-item dispatch over the virtual clock.
///
/// Three paths per message: immediate (synchronous on the caller, when the
/// receiver's lock is free), queued (picked up by a bounded pool of worker
/// threads in start-time order), and future (parked in the futures queue
/// until due under the clock, released by a dedicated thread).
pub struct Scheduler {
  name: String,
  clock: Mutex<Arc<Clock>>,
  ready_queue: WorkItemQueue,
  future_queue: FutureWorkItemQueue,
  workers: SimpleSemaphore,
  futures_pulse: Arc<ManualResetEvent>,
  futures_thread: Mutex<Option<thread::JoinHandle<()>>>,
  started: AtomicBool,
  stopped: AtomicBool,
  forced_shutdown: AtomicBool,
  delay_future_until_due: AtomicBool,
  error_handler: Mutex<Option<ErrorHandler>>,
  first_error: Mutex<Option<PipelineError>>,
  fatal: ManualResetEvent,
  fatal_notifier: Mutex<Option<Arc<ManualResetEvent>>>,
  counters: SchedulerCounters,
  self_weak: Weak<Scheduler>,
}

impl Scheduler {
  pub fn new(options: SchedulerOptions) -> Arc<Scheduler> {
    let thread_count = if options.thread_count == 0 {
      2 * thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
    } else {
      options.thread_count
    };
    Arc::new_cyclic(|weak| Scheduler {
      name: options.name,
      clock: Mutex::new(Arc::new(Clock::default())),
      ready_queue: WorkItemQueue::new(),
      future_queue: FutureWorkItemQueue::new(),
      workers: SimpleSemaphore::new(thread_count),
      futures_pulse: Arc::new(ManualResetEvent::new(false)),
      futures_thread: Mutex::new(None),
      started: AtomicBool::new(false),
      stopped: AtomicBool::new(false),
      forced_shutdown: AtomicBool::new(false),
      delay_future_until_due: AtomicBool::new(options.delay_future_items_until_due),
      error_handler: Mutex::new(None),
      first_error: Mutex::new(None),
      fatal: ManualResetEvent::new(false),
      fatal_notifier: Mutex::new(None),
      counters: SchedulerCounters::default(),
      self_weak: weak.clone(),
    })
  }

  pub fn set_error_handler(&self, handler: Option<ErrorHandler>) {
    *self.error_handler.lock().unwrap() = handler;
  }

  pub(crate) fn clock(&self) -> Arc<Clock> {
    self.clock.lock().unwrap().clone()
  }

  /// Starts dispatch: installs the run clock and spawns the futures thread.
  pub fn start(&self, clock: Arc<Clock>, delay_future_items_until_due: bool) {
    if self.started.swap(true, Ordering::AcqRel) {
      return;
    }
    info!("scheduler {} starting", self.name);
    *self.clock.lock().unwrap() = clock;
    self
      .delay_future_until_due
      .store(delay_future_items_until_due, Ordering::Release);

    let weak = self.self_weak.clone();
    let pulse = Arc::clone(&self.futures_pulse);
    match thread::Builder::new()
      .name(format!("{}-futures", self.name))
      .spawn(move || Self::futures_loop(weak, pulse))
    {
      Ok(handle) => *self.futures_thread.lock().unwrap() = Some(handle),
      Err(e) => error!("scheduler {} failed to spawn futures thread: {e}", self.name),
    }
    self.futures_pulse.set();
  }

  /// Begins scheduling against `context`: the context records the run clock
  /// and previously buffered items for it become eligible.
  pub(crate) fn start_scheduling(&self, context: &Arc<SchedulerContext>) {
    context.start(self.clock());
    self.futures_pulse.set();
  }

  pub(crate) fn stop_scheduling(&self, context: &Arc<SchedulerContext>) {
    context.stop();
    // Wake the futures thread so items buffered for this context are
    // released (and dropped, with their contexts exited).
    self.futures_pulse.set();
  }

  /// Re-evaluate the futures queue, e.g. after a finalize time was set.
  pub(crate) fn pulse_futures(&self) {
    self.futures_pulse.set();
  }

  /// Blocks until nothing is in flight on `context`.
  pub fn pause_for_quiescence(&self, context: &Arc<SchedulerContext>) {
    context.wait_empty();
  }

  /// Holds `lock` so the component it guards cannot be scheduled; the next
  /// post on a frozen emitter queues instead of running synchronously.
  pub(crate) fn freeze(&self, lock: &Arc<SynchronizationLock>) {
    lock.hold();
  }

  pub(crate) fn thaw(&self, lock: &Arc<SynchronizationLock>) {
    lock.release();
    if !self.ready_queue.is_empty() {
      self.ensure_worker();
    }
  }

  /// Stops dispatch. Refuses new enqueues, wakes the futures thread, waits
  /// for the worker permits to return, then drops whatever is left (their
  /// contexts are still exited). With `abandon_pending`, queued items are
  /// dropped without running their callbacks. Idempotent.
  pub fn stop(&self, abandon_pending: bool) {
    if self.stopped.swap(true, Ordering::AcqRel) {
      return;
    }
    if abandon_pending {
      self.forced_shutdown.store(true, Ordering::Release);
    }
    info!(
      "scheduler {} stopping (abandon_pending: {abandon_pending})",
      self.name
    );
    self.futures_pulse.set();
    let futures_thread = self.futures_thread.lock().unwrap().take();
    if let Some(handle) = futures_thread {
      let _ = handle.join();
    }
    self.workers.wait_empty();
    for item in self.ready_queue.drain() {
      self.counters.dropped.fetch_add(1, Ordering::Relaxed);
      item.context.exit();
    }
    for item in self.future_queue.drain() {
      self.counters.dropped.fetch_add(1, Ordering::Relaxed);
      item.context.exit();
    }
    self.started.store(false, Ordering::Release);
  }

  pub fn is_stopped(&self) -> bool {
    self.stopped.load(Ordering::Acquire)
  }

  /// Set when an unrecovered callback error forces the pipeline down.
  pub(crate) fn fatal_event(&self) -> &ManualResetEvent {
    &self.fatal
  }

  pub(crate) fn has_fatal(&self) -> bool {
    self.fatal.is_set()
  }

  /// Additional event to set alongside `fatal`; the owning pipeline parks
  /// its run loop on this.
  pub(crate) fn set_fatal_notifier(&self, notifier: Arc<ManualResetEvent>) {
    *self.fatal_notifier.lock().unwrap() = Some(notifier);
  }

  pub(crate) fn take_first_error(&self) -> Option<PipelineError> {
    self.first_error.lock().unwrap().take()
  }

  pub fn diagnostics(&self) -> SchedulerDiagnostics {
    SchedulerDiagnostics {
      dispatched: self.counters.dispatched.load(Ordering::Relaxed),
      dropped: self.counters.dropped.load(Ordering::Relaxed),
      local_to_global_promotions: self
        .counters
        .local_to_global_promotions
        .load(Ordering::Relaxed),
      ready_queue_len: self.ready_queue.len(),
      future_queue_len: self.future_queue.len(),
    }
  }

  // --------------------------------------------------------------------------
  // Dispatch

  /// Immediate path: runs `action` on the calling thread if the lock can be
  /// taken and the start time is not in the virtual future. Returns whether
  /// the action ran.
  pub(crate) fn try_execute<F>(
    &self,
    lock: &Arc<SynchronizationLock>,
    start_time: Time,
    context: &Arc<SchedulerContext>,
    action: F,
  ) -> bool
  where
    F: FnOnce() -> PipelineResult<()>,
  {
    if self.stopped.load(Ordering::Acquire)
      || self.forced_shutdown.load(Ordering::Acquire)
      || !self.started.load(Ordering::Acquire)
      || !context.is_started()
    {
      return false;
    }
    if start_time > self.clock().now() && self.delay_future_until_due.load(Ordering::Acquire) {
      return false;
    }
    if !lock.try_lock() {
      return false;
    }
    context.enter();
    let result = action();
    context.exit();
    lock.release();
    self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = result {
      self.handle_callback_error(e);
    }
    // Queued items gated on this lock while we held it have no worker
    // waiting for them.
    if !self.ready_queue.is_empty() {
      self.ensure_worker();
    }
    true
  }

  /// Queued/future path. Takes ownership of the context accounting: the
  /// item is entered here and exited on whichever path consumes it.
  pub(crate) fn schedule(&self, item: WorkItem) {
    item.context.enter();
    self.dispatch(item);
  }

  fn dispatch(&self, item: WorkItem) {
    if self.stopped.load(Ordering::Acquire) || item.context.is_stopped() {
      trace!("dropping work item at {}: scheduling stopped", item.start_time);
      self.counters.dropped.fetch_add(1, Ordering::Relaxed);
      item.context.exit();
      return;
    }
    if item.start_time > item.context.finalize_time() {
      trace!("dropping work item at {}: past finalize time", item.start_time);
      self.counters.dropped.fetch_add(1, Ordering::Relaxed);
      item.context.exit();
      return;
    }
    if !self.started.load(Ordering::Acquire) || !item.context.is_started() {
      // Buffered until scheduling starts.
      self.future_queue.enqueue(item);
      self.futures_pulse.set();
      return;
    }
    if item.start_time > self.clock().now() && self.delay_future_until_due.load(Ordering::Acquire)
    {
      self.future_queue.enqueue(item);
      self.futures_pulse.set();
      return;
    }
    self.dispatch_ready(item);
  }

  fn dispatch_ready(&self, item: WorkItem) {
    // A worker may run a follow-up for the lock it already holds directly,
    // provided the follow-up is not later than the current item and the
    // local slot is free.
    let mut item = Some(item);
    let mut was_candidate = false;
    CURRENT_ITEM.with(|current| {
      if let Some((held_lock, current_time)) = &*current.borrow() {
        if let Some(wi) = item.as_ref() {
          if Arc::ptr_eq(&wi.sync_lock, held_lock) {
            was_candidate = true;
            if wi.start_time <= *current_time {
              LOCAL_ITEM.with(|slot| {
                let mut slot = slot.borrow_mut();
                if slot.is_none() {
                  *slot = item.take();
                }
              });
            }
          }
        }
      }
    });
    let Some(item) = item else {
      return; // parked in the local slot
    };
    if was_candidate {
      self
        .counters
        .local_to_global_promotions
        .fetch_add(1, Ordering::Relaxed);
    }
    self.ready_queue.enqueue(item);
    self.ensure_worker();
  }

  fn ensure_worker(&self) {
    if self.stopped.load(Ordering::Acquire) {
      return;
    }
    if !self.workers.try_enter() {
      return; // worker pool at capacity; existing workers will get to it
    }
    let Some(sched) = self.self_weak.upgrade() else {
      self.workers.exit();
      return;
    };
    match thread::Builder::new()
      .name(format!("{}-worker", self.name))
      .spawn(move || sched.worker_loop())
    {
      Ok(_) => {} // detached; tracked through the permit
      Err(e) => {
        error!("scheduler {} failed to spawn worker: {e}", self.name);
        self.workers.exit();
      }
    }
  }

  fn worker_loop(&self) {
    trace!("worker starting");
    loop {
      let Some(item) = self.ready_queue.try_dequeue() else {
        break;
      };
      self.execute_locked(item);
    }
    self.workers.exit();
    // An enqueue racing with our exit may have seen the pool full; make
    // sure such an item is not stranded.
    if !self.ready_queue.is_empty() && !self.stopped.load(Ordering::Acquire) {
      self.ensure_worker();
    }
    trace!("worker exiting");
  }

  /// Runs a dequeued item (whose lock the gate already took), then any
  /// local continuations, then releases the lock.
  fn execute_locked(&self, item: WorkItem) {
    let lock = Arc::clone(&item.sync_lock);
    CURRENT_ITEM.with(|c| *c.borrow_mut() = Some((Arc::clone(&lock), item.start_time)));
    let mut item = item;
    loop {
      let context = Arc::clone(&item.context);
      let skip = self.forced_shutdown.load(Ordering::Acquire)
        || context.is_stopped()
        || item.start_time > context.finalize_time();
      if skip {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
      } else {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.run_callback(item.callback);
      }
      context.exit();
      let next = LOCAL_ITEM.with(|slot| slot.borrow_mut().take());
      match next {
        Some(next) => {
          CURRENT_ITEM.with(|c| *c.borrow_mut() = Some((Arc::clone(&lock), next.start_time)));
          item = next;
        }
        None => break,
      }
    }
    CURRENT_ITEM.with(|c| *c.borrow_mut() = None);
    lock.release();
  }

  fn run_callback(&self, callback: WorkItemCallback) {
    if let Err(e) = callback() {
      self.handle_callback_error(e);
    }
  }

  pub(crate) fn handle_callback_error(&self, e: PipelineError) {
    let handler = self.error_handler.lock().unwrap().clone();
    let handled = match handler {
      Some(h) => h(&e),
      None => false,
    };
    if handled {
      debug!("callback error recovered by handler: {e}");
    } else {
      error!("unrecovered callback error, forcing shutdown: {e}");
      self.initiate_forced_shutdown(e);
    }
  }

  fn initiate_forced_shutdown(&self, e: PipelineError) {
    {
      let mut first = self.first_error.lock().unwrap();
      if first.is_none() {
        *first = Some(e);
      }
    }
    self.forced_shutdown.store(true, Ordering::Release);
    self.fatal.set();
    self.futures_pulse.set();
    if let Some(notifier) = &*self.fatal_notifier.lock().unwrap() {
      notifier.set();
    }
  }

  // --------------------------------------------------------------------------
  // Futures thread

  fn futures_loop(weak: Weak<Scheduler>, pulse: Arc<ManualResetEvent>) {
    trace!("futures thread starting");
    loop {
      let Some(sched) = weak.upgrade() else { return };
      if sched.stopped.load(Ordering::Acquire) {
        trace!("futures thread exiting");
        return;
      }
      pulse.reset();
      sched.promote_due_items();
      // Sleep until the earliest schedulable item is due, or until pulsed
      // (new earlier item, clock change, context start, stop).
      let wait = match sched.future_queue.next_schedulable_time() {
        None => None,
        Some(t) => sched.clock().real_delay_until(t),
      };
      drop(sched);
      match wait {
        Some(d) => {
          pulse.wait_timeout(d.max(StdDuration::from_micros(100)));
        }
        None => pulse.wait(),
      }
    }
  }

  fn promote_due_items(&self) {
    let clock = self.clock();
    let delay = self.delay_future_until_due.load(Ordering::Acquire);
    while let Some(item) = self.future_queue.dequeue_ready(&clock, delay) {
      trace!("promoting work item due at {}", item.start_time);
      self.dispatch(item);
    }
  }
}

// Convenience constructor used by streams: schedule a boxed callback
// directly.
impl Scheduler {
  pub(crate) fn schedule_callback(
    &self,
    sync_lock: Arc<SynchronizationLock>,
    start_time: Time,
    context: Arc<SchedulerContext>,
    callback: WorkItemCallback,
  ) {
    self.schedule(WorkItem::new(sync_lock, start_time, context, callback));
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;

  use super::*;

  fn started_scheduler(delay: bool) -> (Arc<Scheduler>, Arc<SchedulerContext>) {
    let scheduler = Scheduler::new(SchedulerOptions {
      thread_count: 2,
      delay_future_items_until_due: delay,
      name: "test".to_string(),
    });
    let context = Arc::new(SchedulerContext::new());
    scheduler.start(Arc::new(Clock::real_time(Time::UNIX_EPOCH)), delay);
    scheduler.start_scheduling(&context);
    (scheduler, context)
  }

  #[test]
  fn queued_items_run_and_context_drains() {
    let (scheduler, context) = started_scheduler(true);
    let lock = Arc::new(SynchronizationLock::new());
    let counter = Arc::new(AtomicUsize::new(0));
    for i in 0..10 {
      let counter = Arc::clone(&counter);
      scheduler.schedule_callback(
        Arc::clone(&lock),
        Time::UNIX_EPOCH + crate::structure::time::Duration::from_ticks(i),
        Arc::clone(&context),
        Box::new(move || {
          counter.fetch_add(1, Ordering::SeqCst);
          Ok(())
        }),
      );
    }
    scheduler.pause_for_quiescence(&context);
    assert_eq!(counter.load(Ordering::SeqCst), 10);
    assert_eq!(context.in_flight(), 0);
    scheduler.stop(false);
  }

  #[test]
  fn immediate_path_runs_inline() {
    let (scheduler, context) = started_scheduler(true);
    let lock = Arc::new(SynchronizationLock::new());
    let mut ran = false;
    let executed = scheduler.try_execute(&lock, Time::UNIX_EPOCH, &context, || {
      ran = true;
      Ok(())
    });
    assert!(executed);
    assert!(ran);
    assert!(!lock.is_held());
    scheduler.stop(false);
  }

  #[test]
  fn immediate_path_respects_held_lock() {
    let (scheduler, context) = started_scheduler(true);
    let lock = Arc::new(SynchronizationLock::new());
    scheduler.freeze(&lock);
    let executed = scheduler.try_execute(&lock, Time::UNIX_EPOCH, &context, || Ok(()));
    assert!(!executed);
    scheduler.thaw(&lock);
    scheduler.stop(false);
  }

  #[test]
  fn future_items_wait_for_the_clock() {
    let (scheduler, context) = started_scheduler(true);
    let lock = Arc::new(SynchronizationLock::new());
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = Arc::clone(&ran);
    // 20 ms into the virtual future on a real-time clock.
    let due = scheduler.clock().now() + crate::structure::time::Duration::from_millis(20);
    scheduler.schedule_callback(
      lock,
      due,
      Arc::clone(&context),
      Box::new(move || {
        ran2.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }),
    );
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    thread::sleep(StdDuration::from_millis(60));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    scheduler.pause_for_quiescence(&context);
    scheduler.stop(false);
  }

  #[test]
  fn stopped_context_drops_items_but_exits() {
    let (scheduler, context) = started_scheduler(true);
    let lock = Arc::new(SynchronizationLock::new());
    scheduler.stop_scheduling(&context);
    scheduler.schedule_callback(
      lock,
      Time::UNIX_EPOCH,
      Arc::clone(&context),
      Box::new(|| panic!("must not run")),
    );
    scheduler.pause_for_quiescence(&context);
    assert_eq!(context.in_flight(), 0);
    scheduler.stop(false);
  }

  #[test]
  fn unrecovered_error_forces_shutdown() {
    let (scheduler, context) = started_scheduler(true);
    let lock = Arc::new(SynchronizationLock::new());
    scheduler.schedule_callback(
      lock,
      Time::UNIX_EPOCH,
      Arc::clone(&context),
      Box::new(|| Err(PipelineError::callback("boom"))),
    );
    scheduler.fatal_event().wait();
    scheduler.stop(true);
    let err = scheduler.take_first_error();
    assert!(matches!(err, Some(PipelineError::CallbackFailure { .. })));
  }

  #[test]
  fn handled_error_keeps_scheduling() {
    let (scheduler, context) = started_scheduler(true);
    scheduler.set_error_handler(Some(Arc::new(|_| true)));
    let lock = Arc::new(SynchronizationLock::new());
    let ok_ran = Arc::new(AtomicUsize::new(0));
    scheduler.schedule_callback(
      Arc::clone(&lock),
      Time::UNIX_EPOCH,
      Arc::clone(&context),
      Box::new(|| Err(PipelineError::callback("handled"))),
    );
    let ok_ran2 = Arc::clone(&ok_ran);
    scheduler.schedule_callback(
      lock,
      Time::UNIX_EPOCH + crate::structure::time::Duration::from_ticks(1),
      Arc::clone(&context),
      Box::new(move || {
        ok_ran2.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }),
    );
    scheduler.pause_for_quiescence(&context);
    assert_eq!(ok_ran.load(Ordering::SeqCst), 1);
    assert!(scheduler.take_first_error().is_none());
    scheduler.stop(false);
  }

  #[test]
  fn stop_is_idempotent() {
    let (scheduler, _context) = started_scheduler(true);
    scheduler.stop(false);
    scheduler.stop(false);
    scheduler.stop(true);
  }
}
