use std::sync::{
  atomic::{AtomicI32, AtomicUsize, Ordering},
  Arc, Mutex, Weak,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::{PipelineError, PipelineResult},
  pipeline::{
    element::{ElementState, PipelineElement, SourceComponent},
    replay::ReplayDescriptor,
  },
  scheduling::{
    context::SchedulerContext,
    scheduler::{ErrorHandler, Scheduler, SchedulerDiagnostics, SchedulerOptions},
  },
  streams::{receiver::ReceiverCallback, Emitter, Receiver, StreamHost},
  structure::{envelope::Envelope, time::Time},
  sync::event::ManualResetEvent,
};

static NEXT_PIPELINE_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PipelineState {
  NotStarted,
  Running,
  Stopping,
  Stopped,
}

#[derive(Clone, Default)]
pub struct PipelineOptions {
  pub name: Option<String>,
  pub scheduler: SchedulerOptions,
  /// Consulted when a component callback fails; `true` means "recovered,
  /// keep going". Without a handler every callback failure forces
  /// shutdown.
  pub error_handler: Option<ErrorHandler>,
}

/// Tracks finite-source completion: the pipeline self-stops once every
/// source has reported a completion time, unless one of them is infinite.
struct CompletionTracker {
  pending_sources: usize,
  latest: Time,
  infinite: bool,
  all_reported: bool,
}

/// Per-receiver snapshot for diagnostics.
#[derive(Debug, Clone)]
pub struct ReceiverDiagnostics {
  pub element: String,
  pub receiver: String,
  pub queued: usize,
  pub dropped: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineDiagnostics {
  pub scheduler: SchedulerDiagnostics,
  pub receivers: Vec<ReceiverDiagnostics>,
}

/// The pipeline: component and stream registry plus lifecycle
/// (create -> run -> stop).
///
/// `run` blocks until all finite sources complete, an unrecovered error
/// forces shutdown, or `stop` is called from another thread. Element and
/// endpoint creation happens before `run`; late subscription requires an
/// explicit opt-in at subscribe time.
pub struct Pipeline {
  id: usize,
  name: String,
  host: Arc<StreamHost>,
  scheduler: Arc<Scheduler>,
  context: Arc<SchedulerContext>,
  elements: Mutex<Vec<Arc<PipelineElement>>>,
  state: Mutex<PipelineState>,
  next_stream_id: AtomicI32,
  next_element_id: AtomicUsize,
  completion: ManualResetEvent,
  wake: Arc<ManualResetEvent>,
  completion_state: Mutex<CompletionTracker>,
  run_error: Mutex<Option<PipelineError>>,
  is_root: bool,
  self_weak: Weak<Pipeline>,
}

impl Pipeline {
  pub fn new(options: PipelineOptions) -> Arc<Pipeline> {
    let id = NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed);
    let name = options
      .name
      .unwrap_or_else(|| format!("pipeline-{id}"));
    let mut scheduler_options = options.scheduler;
    if scheduler_options.name == "scheduler" {
      scheduler_options.name = name.clone();
    }
    let scheduler = Scheduler::new(scheduler_options);
    scheduler.set_error_handler(options.error_handler);
    Self::build(id, name, scheduler, true)
  }

  /// A nested pipeline sharing this pipeline's scheduler (and therefore
  /// its clock snapshot) but scheduling on an independent context, so it
  /// can be stopped without stopping the parent.
  pub fn create_subpipeline(&self, name: impl Into<String>) -> Arc<Pipeline> {
    let id = NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed);
    Self::build(id, name.into(), Arc::clone(&self.scheduler), false)
  }

  fn build(id: usize, name: String, scheduler: Arc<Scheduler>, is_root: bool) -> Arc<Pipeline> {
    let context = Arc::new(SchedulerContext::new());
    let host = Arc::new(StreamHost::new(
      id,
      name.clone(),
      Arc::clone(&scheduler),
      Arc::clone(&context),
    ));
    Arc::new_cyclic(|weak| Pipeline {
      id,
      name,
      host,
      scheduler,
      context,
      elements: Mutex::new(Vec::new()),
      state: Mutex::new(PipelineState::NotStarted),
      next_stream_id: AtomicI32::new(1),
      next_element_id: AtomicUsize::new(0),
      completion: ManualResetEvent::new(false),
      wake: Arc::new(ManualResetEvent::new(false)),
      completion_state: Mutex::new(CompletionTracker {
        pending_sources: 0,
        latest: Time::MIN,
        infinite: false,
        all_reported: false,
      }),
      run_error: Mutex::new(None),
      is_root,
      self_weak: weak.clone(),
    })
  }

  pub fn id(&self) -> usize {
    self.id
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn state(&self) -> PipelineState {
    *self.state.lock().unwrap()
  }

  /// Registers a new element (graph node).
  pub fn add_element(&self, name: impl Into<String>) -> Arc<PipelineElement> {
    let id = self.next_element_id.fetch_add(1, Ordering::Relaxed);
    let element = PipelineElement::new(id, name.into());
    self.elements.lock().unwrap().push(Arc::clone(&element));
    element
  }

  /// Attaches a source component to an element. Sources are started by
  /// `run` and drive pipeline completion.
  pub fn attach_source(
    &self,
    element: &Arc<PipelineElement>,
    component: impl SourceComponent + 'static,
  ) {
    element.attach_source(Box::new(component));
  }

  /// Creates a typed output endpoint owned by `element`.
  pub fn create_emitter<T: Clone + Send + 'static>(
    &self,
    element: &Arc<PipelineElement>,
    name: impl Into<String>,
  ) -> Arc<Emitter<T>> {
    let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
    let emitter = Emitter::new(
      Arc::clone(&self.host),
      Arc::clone(element.sync_lock()),
      id,
      name.into(),
    );
    element.register_emitter(emitter.clone());
    emitter
  }

  /// Creates a typed input endpoint owned by `element`, delivering to
  /// `action`.
  pub fn create_receiver<T, F>(
    &self,
    element: &Arc<PipelineElement>,
    name: impl Into<String>,
    action: F,
  ) -> Arc<Receiver<T>>
  where
    T: Clone + Send + 'static,
    F: Fn(&T, &Envelope) -> PipelineResult<()> + Send + Sync + 'static,
  {
    let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
    let callback: ReceiverCallback<T> = Box::new(action);
    let receiver = Receiver::new(
      Arc::clone(&self.host),
      Arc::clone(element.sync_lock()),
      id,
      name.into(),
      callback,
    );
    element.register_receiver(receiver.clone());
    receiver
  }

  /// Runs the pipeline to completion: `start` + `wait_for_completion`.
  pub fn run(&self, descriptor: ReplayDescriptor) -> PipelineResult<()> {
    self.start(descriptor)?;
    self.wait_for_completion()
  }

  /// Starts sources and scheduling without blocking.
  pub fn start(&self, descriptor: ReplayDescriptor) -> PipelineResult<()> {
    {
      let mut state = self.state.lock().unwrap();
      if *state != PipelineState::NotStarted {
        return Err(PipelineError::AlreadyRunning {
          name: self.name.clone(),
        });
      }
      *state = PipelineState::Running;
    }
    info!("pipeline {} starting", self.name);

    // For a subpipeline the scheduler is already started and keeps the
    // parent's clock; `Scheduler::start` is first-wins.
    let clock = Arc::new(descriptor.to_clock());
    self
      .scheduler
      .start(clock, descriptor.delay_future_items_until_due());
    if self.is_root {
      self.scheduler.set_fatal_notifier(Arc::clone(&self.wake));
    }
    self.scheduler.start_scheduling(&self.context);
    self.host.set_running(true);

    let elements = self.elements.lock().unwrap().clone();
    for element in &elements {
      element.set_state(ElementState::Started);
    }

    let sources: Vec<_> = elements.iter().filter(|e| e.is_source()).cloned().collect();
    {
      let mut tracker = self.completion_state.lock().unwrap();
      tracker.pending_sources = sources.len();
      tracker.latest = Time::MIN;
      tracker.infinite = false;
      tracker.all_reported = false;
    }
    for element in &sources {
      let this = self.self_weak.clone();
      let started = element.start_source(Box::new(move |final_time| {
        if let Some(pipeline) = this.upgrade() {
          pipeline.on_source_completed(final_time);
        }
      }));
      if let Err(e) = started {
        error!("pipeline {}: source {} failed to start", self.name, element.name());
        self.shutdown(true);
        return Err(e);
      }
    }
    Ok(())
  }

  /// Blocks until the pipeline stops: all finite sources completed, an
  /// unrecovered error forced shutdown, or another thread called `stop`.
  pub fn wait_for_completion(&self) -> PipelineResult<()> {
    loop {
      self.wake.wait();
      self.wake.reset();
      if self.state() == PipelineState::Stopped {
        break;
      }
      if self.scheduler.has_fatal() {
        self.shutdown(true);
        break;
      }
      if self.completion_state.lock().unwrap().all_reported {
        self.shutdown(false);
        break;
      }
    }
    match self.run_error.lock().unwrap().take() {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }

  /// Stops the pipeline. In-flight work completes unless `abandon_pending`
  /// is set (queued items are then dropped, with their context accounting
  /// still honored). Idempotent.
  pub fn stop(&self, abandon_pending: bool) {
    self.shutdown(abandon_pending);
  }

  /// First unrecovered error of the run, if any. Taken, not cloned.
  pub fn take_error(&self) -> Option<PipelineError> {
    self.run_error.lock().unwrap().take()
  }

  pub fn diagnostics(&self) -> PipelineDiagnostics {
    let mut receivers = Vec::new();
    for element in self.elements.lock().unwrap().iter() {
      for receiver in element.receivers() {
        receivers.push(ReceiverDiagnostics {
          element: element.name().to_string(),
          receiver: receiver.name().to_string(),
          queued: receiver.queued_len(),
          dropped: receiver.dropped_count(),
        });
      }
    }
    PipelineDiagnostics {
      scheduler: self.scheduler.diagnostics(),
      receivers,
    }
  }

  // ---------------------------------------------------------------------------

  fn on_source_completed(&self, final_time: Time) {
    let mut tracker = self.completion_state.lock().unwrap();
    tracker.pending_sources = tracker.pending_sources.saturating_sub(1);
    if final_time == Time::MAX {
      tracker.infinite = true;
    } else if final_time > tracker.latest {
      tracker.latest = final_time;
    }
    debug!(
      "pipeline {}: source completed at {final_time} ({} pending)",
      self.name, tracker.pending_sources
    );
    if tracker.pending_sources == 0 && !tracker.infinite {
      tracker.all_reported = true;
      drop(tracker);
      self.wake.set();
    }
  }

  /// The one stop path. Orderly sequence: stop sources, close emitters,
  /// finalize the context, drain to quiescence, stop scheduling.
  fn shutdown(&self, abandon_pending: bool) {
    {
      let mut state = self.state.lock().unwrap();
      match *state {
        PipelineState::Stopping | PipelineState::Stopped => {
          drop(state);
          self.completion.wait();
          return;
        }
        _ => *state = PipelineState::Stopping,
      }
    }
    info!(
      "pipeline {} stopping (abandon_pending: {abandon_pending})",
      self.name
    );
    self.host.set_running(false);

    let elements = self.elements.lock().unwrap().clone();
    let sources: Vec<_> = elements.iter().filter(|e| e.is_source()).cloned().collect();

    // Ask sources to stop and wait until they have ceased posting.
    let final_time = {
      let tracker = self.completion_state.lock().unwrap();
      if tracker.all_reported {
        tracker.latest
      } else {
        self.scheduler.clock().now()
      }
    };
    let pending = Arc::new(AtomicUsize::new(sources.len()));
    let sources_stopped = Arc::new(ManualResetEvent::new(sources.is_empty()));
    for element in &sources {
      element.set_state(ElementState::Stopping);
      let pending_cb = Arc::clone(&pending);
      let sources_stopped_cb = Arc::clone(&sources_stopped);
      let stopped = element.stop_source(
        final_time,
        Box::new(move || {
          if pending_cb.fetch_sub(1, Ordering::AcqRel) == 1 {
            sources_stopped_cb.set();
          }
        }),
      );
      if let Err(e) = stopped {
        error!("pipeline {}: source {} failed to stop: {e}", self.name, element.name());
        if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
          sources_stopped.set();
        }
      }
    }
    sources_stopped.wait();

    // Let in-flight data drain before the streams close, so transforms can
    // still forward everything they were delivered.
    if !abandon_pending {
      self.scheduler.pause_for_quiescence(&self.context);
    }

    // Close every stream so receivers observe the closing markers, then
    // finalize past the latest closing time.
    let mut finalize_time = final_time.max(self.completion_state.lock().unwrap().latest);
    for element in &elements {
      element.set_state(ElementState::Stopping);
      finalize_time = finalize_time.max(element.close_emitters(final_time));
    }
    self.context.set_finalize_time(finalize_time);
    // Items already parked past the finalize time must be flushed out.
    self.scheduler.pulse_futures();

    if abandon_pending {
      if self.is_root {
        // Forced shutdown drops queued work (contexts still exited), so
        // quiescence follows from the scheduler drain.
        self.scheduler.stop(true);
        self.scheduler.pause_for_quiescence(&self.context);
        self.scheduler.stop_scheduling(&self.context);
      } else {
        // Subpipeline: stopping the context makes its pending items
        // skippable; the shared scheduler stays up for the parent.
        self.scheduler.stop_scheduling(&self.context);
        self.scheduler.pause_for_quiescence(&self.context);
      }
    } else {
      self.scheduler.pause_for_quiescence(&self.context);
      self.scheduler.stop_scheduling(&self.context);
      if self.is_root {
        self.scheduler.stop(false);
      }
    }

    for element in &elements {
      element.set_state(ElementState::Stopped);
    }
    if let Some(e) = self.scheduler.take_first_error() {
      *self.run_error.lock().unwrap() = Some(PipelineError::ForcedShutdown { cause: Box::new(e) });
    }
    *self.state.lock().unwrap() = PipelineState::Stopped;
    info!("pipeline {} stopped", self.name);
    self.completion.set();
    self.wake.set();
  }
}

impl Drop for Pipeline {
  fn drop(&mut self) {
    // A pipeline dropped while running is torn down; threads must not be
    // left behind.
    if self.state() == PipelineState::Running {
      self.shutdown(true);
    }
  }
}
