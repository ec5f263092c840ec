use std::sync::{Arc, Mutex};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::PipelineResult,
  streams::{emitter::ErasedEmitter, receiver::ErasedReceiver, Emitter, Receiver},
  structure::time::Time,
  sync::lock::SynchronizationLock,
};

/// Lifecycle state of a pipeline element.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ElementState {
  NotStarted,
  Started,
  Stopping,
  Stopped,
}

/// A component that generates messages on its own (a camera, a file reader,
/// a synthetic generator), as opposed to one that only reacts to received
/// messages.
///
/// Sources drive pipeline completion: a finite source eventually reports
/// the originating time of its last message through
/// `notify_completion_time`; a non-finite source reports `Time::MAX`.
pub trait SourceComponent: Send {
  /// Begin posting. `notify_completion_time` must eventually be called
  /// with the originating time of the source's final message, or
  /// `Time::MAX` if the source never completes on its own.
  fn start(&mut self, notify_completion_time: Box<dyn FnOnce(Time) + Send>) -> PipelineResult<()>;

  /// Stop posting. No messages with originating time past
  /// `final_originating_time` may be posted; `notify_completed` must be
  /// called once posting has ceased.
  fn stop(
    &mut self,
    final_originating_time: Time,
    notify_completed: Box<dyn FnOnce() + Send>,
  ) -> PipelineResult<()>;
}

/// A component with one output stream.
pub trait Producer<T: Clone + Send + 'static> {
  fn output(&self) -> &Arc<Emitter<T>>;
}

/// A component with one input stream.
pub trait Consumer<T: Clone + Send + 'static> {
  fn input(&self) -> &Arc<Receiver<T>>;
}

/// A transform: one input, one output.
pub trait ConsumerProducer<TIn, TOut>: Consumer<TIn> + Producer<TOut>
where
  TIn: Clone + Send + 'static,
  TOut: Clone + Send + 'static,
{
}

/// One node of the pipeline graph: a component together with its endpoints
/// and its exclusivity lock. The element exclusively owns its endpoints;
/// the pipeline exclusively owns its elements.
pub struct PipelineElement {
  id: usize,
  name: String,
  state: Mutex<ElementState>,
  sync_lock: Arc<SynchronizationLock>,
  source: Mutex<Option<Box<dyn SourceComponent>>>,
  receivers: Mutex<Vec<Arc<dyn ErasedReceiver>>>,
  emitters: Mutex<Vec<Arc<dyn ErasedEmitter>>>,
}

impl PipelineElement {
  pub(crate) fn new(id: usize, name: String) -> Arc<PipelineElement> {
    Arc::new(PipelineElement {
      id,
      name,
      state: Mutex::new(ElementState::NotStarted),
      sync_lock: Arc::new(SynchronizationLock::new()),
      source: Mutex::new(None),
      receivers: Mutex::new(Vec::new()),
      emitters: Mutex::new(Vec::new()),
    })
  }

  pub fn id(&self) -> usize {
    self.id
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn state(&self) -> ElementState {
    *self.state.lock().unwrap()
  }

  pub(crate) fn set_state(&self, state: ElementState) {
    trace!("element {} -> {state:?}", self.name);
    *self.state.lock().unwrap() = state;
  }

  /// The component's single exclusivity token. All of the element's
  /// callbacks are serialized on it.
  pub(crate) fn sync_lock(&self) -> &Arc<SynchronizationLock> {
    &self.sync_lock
  }

  pub(crate) fn attach_source(&self, component: Box<dyn SourceComponent>) {
    *self.source.lock().unwrap() = Some(component);
  }

  pub fn is_source(&self) -> bool {
    self.source.lock().unwrap().is_some()
  }

  pub(crate) fn register_emitter(&self, emitter: Arc<dyn ErasedEmitter>) {
    self.emitters.lock().unwrap().push(emitter);
  }

  pub(crate) fn register_receiver(&self, receiver: Arc<dyn ErasedReceiver>) {
    self.receivers.lock().unwrap().push(receiver);
  }

  pub(crate) fn emitters(&self) -> Vec<Arc<dyn ErasedEmitter>> {
    self.emitters.lock().unwrap().clone()
  }

  pub(crate) fn receivers(&self) -> Vec<Arc<dyn ErasedReceiver>> {
    self.receivers.lock().unwrap().clone()
  }

  pub(crate) fn start_source(
    &self,
    notify_completion_time: Box<dyn FnOnce(Time) + Send>,
  ) -> PipelineResult<()> {
    match &mut *self.source.lock().unwrap() {
      Some(component) => component.start(notify_completion_time),
      None => Ok(()),
    }
  }

  pub(crate) fn stop_source(
    &self,
    final_originating_time: Time,
    notify_completed: Box<dyn FnOnce() + Send>,
  ) -> PipelineResult<()> {
    match &mut *self.source.lock().unwrap() {
      Some(component) => component.stop(final_originating_time, notify_completed),
      None => {
        notify_completed();
        Ok(())
      }
    }
  }

  /// Closes every emitter of this element at `final_time` (or just after
  /// whatever it last posted). Returns the latest closing time actually
  /// used, so the pipeline can finalize past it.
  pub(crate) fn close_emitters(&self, final_time: Time) -> Time {
    let mut latest = Time::MIN;
    for emitter in self.emitters() {
      let closed_at = emitter.close_at(final_time);
      latest = latest.max(closed_at);
    }
    latest
  }
}
