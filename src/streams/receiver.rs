use std::sync::{Arc, Mutex, Weak};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::{PipelineError, PipelineResult},
  streams::{
    delivery_policy::DeliveryPolicy,
    delivery_queue::{DeliveryQueue, QueueEntry, QueueTransition},
    recycling::RecyclingPool,
    StreamHost,
  },
  structure::{envelope::Envelope, time::Time},
  sync::lock::SynchronizationLock,
};

/// The component callback invoked for each delivered message.
pub type ReceiverCallback<T> = Box<dyn Fn(&T, &Envelope) -> PipelineResult<()> + Send + Sync>;

type UnsubscribedHandler = Box<dyn FnOnce(Time) + Send>;

/// Non-owning link back to the source emitter, cleared on unsubscribe.
struct SourceLink {
  emitter_name: String,
  emitter_lock: Arc<SynchronizationLock>,
}

/// Typed stream input endpoint, owned by a component.
///
/// A message arriving on the receiver either runs the callback right on the
/// posting thread (when the policy allows it, the queue is empty and the
/// owning component's lock is free) or is cloned into the delivery queue,
/// from which scheduled `deliver_next` pumps drain it in originating-time
/// order. Payloads always return to the recycling pool after the callback.
pub struct Receiver<T: Clone + Send + 'static> {
  id: i32,
  name: String,
  host: Arc<StreamHost>,
  sync_lock: Arc<SynchronizationLock>,
  on_received: ReceiverCallback<T>,
  queue: DeliveryQueue<T>,
  pool: RecyclingPool<T>,
  source: Mutex<Option<SourceLink>>,
  last_envelope: Mutex<Option<Envelope>>,
  unsubscribed_handlers: Mutex<Vec<UnsubscribedHandler>>,
  self_weak: Weak<Receiver<T>>,
}

impl<T: Clone + Send + 'static> Receiver<T> {
  pub(crate) fn new(
    host: Arc<StreamHost>,
    sync_lock: Arc<SynchronizationLock>,
    id: i32,
    name: String,
    on_received: ReceiverCallback<T>,
  ) -> Arc<Receiver<T>> {
    Arc::new_cyclic(|weak| Receiver {
      id,
      name,
      host,
      sync_lock,
      on_received,
      queue: DeliveryQueue::new(DeliveryPolicy::unlimited()),
      pool: RecyclingPool::new(),
      source: Mutex::new(None),
      last_envelope: Mutex::new(None),
      unsubscribed_handlers: Mutex::new(Vec::new()),
      self_weak: weak.clone(),
    })
  }

  pub fn id(&self) -> i32 {
    self.id
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub(crate) fn pipeline_id(&self) -> usize {
    self.host.pipeline_id
  }

  pub fn last_envelope(&self) -> Option<Envelope> {
    *self.last_envelope.lock().unwrap()
  }

  pub fn has_source(&self) -> bool {
    self.source.lock().unwrap().is_some()
  }

  /// Messages dropped by queue limits or the latency bound so far.
  pub fn dropped_count(&self) -> u64 {
    self.queue.dropped_count()
  }

  pub fn queued_len(&self) -> usize {
    self.queue.len()
  }

  /// Registers a handler invoked exactly once, with the final originating
  /// time, when the source stream closes.
  pub fn on_unsubscribed(&self, handler: impl FnOnce(Time) + Send + 'static) {
    self
      .unsubscribed_handlers
      .lock()
      .unwrap()
      .push(Box::new(handler));
  }

  pub(crate) fn bind_source(
    &self,
    emitter_name: String,
    emitter_lock: Arc<SynchronizationLock>,
    policy: DeliveryPolicy<T>,
  ) -> PipelineResult<()> {
    {
      let mut source = self.source.lock().unwrap();
      if source.is_some() {
        return Err(PipelineError::AlreadySubscribed {
          receiver: self.name.clone(),
        });
      }
      *source = Some(SourceLink {
        emitter_name,
        emitter_lock,
      });
    }
    // No message can flow until the emitter lists us, which happens after
    // this returns; the policy is in place by then. Taking the queue lock
    // outside the source lock keeps the lock order consistent with the
    // throttle path.
    self.queue.set_policy(policy);
    Ok(())
  }

  pub(crate) fn clear_source(&self) {
    *self.source.lock().unwrap() = None;
  }

  /// Entry point for messages from the source emitter.
  pub(crate) fn receive(&self, data: &T, envelope: Envelope) {
    if self.queue.attempts_synchronous_delivery()
      && !envelope.is_closing()
      && self.queue.is_empty()
    {
      let executed = self.host.scheduler.try_execute(
        &self.sync_lock,
        envelope.originating_time,
        &self.host.context,
        || {
          *self.last_envelope.lock().unwrap() = Some(envelope);
          (self.on_received)(data, &envelope)
        },
      );
      if executed {
        return;
      }
    }
    let data = self.pool.take_clone(data);
    let transition = self.queue.enqueue(
      QueueEntry {
        data: Some(data),
        envelope,
      },
      &self.pool,
      |start| self.apply_throttle(start),
    );
    self.handle_transitions(transition, envelope.originating_time);
  }

  /// Entry point for the closing marker.
  pub(crate) fn receive_closing(&self, envelope: Envelope) {
    let transition = self.queue.enqueue(
      QueueEntry {
        data: None,
        envelope,
      },
      &self.pool,
      |start| self.apply_throttle(start),
    );
    self.handle_transitions(transition, envelope.originating_time);
  }

  fn handle_transitions(&self, transition: enumflags2::BitFlags<QueueTransition>, time: Time) {
    if transition.intersects(QueueTransition::ToNotEmpty | QueueTransition::ToClosing) {
      self.schedule_delivery(time);
    }
  }

  /// Back-pressure: holds or releases the source emitter's lock. Called by
  /// the delivery queue, under its lock, at threshold crossings.
  fn apply_throttle(&self, start: bool) {
    if let Some(link) = &*self.source.lock().unwrap() {
      trace!(
        "receiver {} {} emitter {}",
        self.name,
        if start { "throttling" } else { "releasing" },
        link.emitter_name
      );
      if start {
        self.host.scheduler.freeze(&link.emitter_lock);
      } else {
        self.host.scheduler.thaw(&link.emitter_lock);
      }
    }
  }

  fn schedule_delivery(&self, time: Time) {
    let this = self.self_weak.clone();
    self.host.scheduler.schedule_callback(
      Arc::clone(&self.sync_lock),
      time,
      Arc::clone(&self.host.context),
      Box::new(move || match this.upgrade() {
        Some(receiver) => receiver.deliver_next(),
        None => Ok(()),
      }),
    );
  }

  /// Delivers the next queued message. Runs under the owning component's
  /// lock, via the scheduler.
  fn deliver_next(&self) -> PipelineResult<()> {
    let now = self.host.scheduler.clock().now();
    let (entry, transition, next_time) =
      self
        .queue
        .dequeue(now, &self.pool, |start| self.apply_throttle(start));
    let Some(entry) = entry else {
      return Ok(());
    };
    if entry.envelope.is_closing() {
      self.complete_closing(entry.envelope.originating_time);
      return Ok(());
    }
    let Some(data) = entry.data else {
      // Cannot happen: only closing entries carry no payload.
      return Ok(());
    };
    *self.last_envelope.lock().unwrap() = Some(entry.envelope);
    let result = (self.on_received)(&data, &entry.envelope);
    self.pool.recycle(data);
    if !transition.contains(QueueTransition::ToEmpty) {
      if let Some(next_time) = next_time {
        self.schedule_delivery(next_time);
      }
    }
    result
  }

  /// The source stream has closed: run the unsubscribed handlers exactly
  /// once, then drop the source link (last, so the element stays pinned
  /// while handlers run).
  fn complete_closing(&self, final_originating_time: Time) {
    debug!(
      "receiver {} source closed at {final_originating_time}",
      self.name
    );
    let handlers: Vec<UnsubscribedHandler> =
      std::mem::take(&mut *self.unsubscribed_handlers.lock().unwrap());
    for handler in handlers {
      handler(final_originating_time);
    }
    self.clear_source();
  }
}

/// Type-erased receiver view held by the pipeline registry.
pub(crate) trait ErasedReceiver: Send + Sync {
  fn id(&self) -> i32;
  fn name(&self) -> &str;
  fn type_name(&self) -> &'static str;
  fn queued_len(&self) -> usize;
  fn dropped_count(&self) -> u64;
}

impl<T: Clone + Send + 'static> ErasedReceiver for Receiver<T> {
  fn id(&self) -> i32 {
    self.id
  }

  fn name(&self) -> &str {
    &self.name
  }

  fn type_name(&self) -> &'static str {
    std::any::type_name::<T>()
  }

  fn queued_len(&self) -> usize {
    Receiver::queued_len(self)
  }

  fn dropped_count(&self) -> u64 {
    Receiver::dropped_count(self)
  }
}
