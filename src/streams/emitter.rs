use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc, Mutex, Weak,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  error::{PipelineError, PipelineResult},
  streams::{delivery_policy::DeliveryPolicy, receiver::Receiver, StreamHost},
  structure::{
    envelope::{Envelope, CLOSING_SEQUENCE_ID},
    time::{Duration, Time},
  },
  sync::lock::SynchronizationLock,
};

struct EmitterState {
  last_envelope: Option<Envelope>,
  next_sequence_id: i32,
  closed: bool,
}

struct Subscription<T: Clone + Send + 'static> {
  receiver: Weak<Receiver<T>>,
  receiver_id: i32,
}

impl<T: Clone + Send + 'static> Clone for Subscription<T> {
  fn clone(&self) -> Self {
    Subscription {
      receiver: self.receiver.clone(),
      receiver_id: self.receiver_id,
    }
  }
}

/// Typed stream output endpoint, owned by a component.
///
/// Posting stamps an envelope (validated for monotonicity) and hands the
/// message to every subscribed receiver. Delivery runs through the
/// scheduler against the emitter's own lock: a frozen (throttled) emitter
/// therefore queues its deliveries instead of running them on the posting
/// thread, without ever blocking the poster.
///
/// Receivers are held weakly; their lifetime belongs to the owning
/// component.
pub struct Emitter<T: Clone + Send + 'static> {
  id: i32,
  name: String,
  host: Arc<StreamHost>,
  sync_lock: Arc<SynchronizationLock>,
  state: Mutex<EmitterState>,
  subscribers: Mutex<Arc<Vec<Subscription<T>>>>,
  // Deliveries queued behind a held lock (throttling, a busy component).
  // While any are pending, new posts must queue behind them; running one
  // synchronously would overtake earlier messages.
  pending_deliveries: AtomicUsize,
  self_weak: Weak<Emitter<T>>,
}

impl<T: Clone + Send + 'static> Emitter<T> {
  pub(crate) fn new(
    host: Arc<StreamHost>,
    sync_lock: Arc<SynchronizationLock>,
    id: i32,
    name: String,
  ) -> Arc<Emitter<T>> {
    Arc::new_cyclic(|weak| Emitter {
      id,
      name,
      host,
      sync_lock,
      state: Mutex::new(EmitterState {
        last_envelope: None,
        next_sequence_id: 1,
        closed: false,
      }),
      subscribers: Mutex::new(Arc::new(Vec::new())),
      pending_deliveries: AtomicUsize::new(0),
      self_weak: weak.clone(),
    })
  }

  pub fn id(&self) -> i32 {
    self.id
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn last_envelope(&self) -> Option<Envelope> {
    self.state.lock().unwrap().last_envelope
  }

  pub fn is_closed(&self) -> bool {
    self.state.lock().unwrap().closed
  }

  pub fn subscriber_count(&self) -> usize {
    self.subscribers.lock().unwrap().len()
  }

  /// Posts a message. No-op once the stream is closed.
  ///
  /// Fails with `InvalidSequence` if `originating_time` does not advance
  /// past the previously posted message.
  pub fn post(&self, data: T, originating_time: Time) -> PipelineResult<()> {
    let envelope = match self.stamp(originating_time, false)? {
      Some(envelope) => envelope,
      None => return Ok(()),
    };
    trace!(
      "emitter {} posting seq {} at {}",
      self.name,
      envelope.sequence_id,
      envelope.originating_time
    );
    self.deliver_or_queue(Some(data), envelope);
    Ok(())
  }

  /// Closes the stream: posts the closing marker and, once it is out,
  /// clears the subscriber list. Subsequent posts are no-ops.
  pub fn close(&self, originating_time: Time) -> PipelineResult<()> {
    let envelope = match self.stamp(originating_time, true)? {
      Some(envelope) => envelope,
      None => return Ok(()),
    };
    debug!("emitter {} closing at {}", self.name, originating_time);
    self.deliver_or_queue(None, envelope);
    Ok(())
  }

  /// Subscribes `receiver` with `policy`.
  ///
  /// Rejected if the pipeline is already running (unless
  /// `allow_while_running`), if the endpoints belong to different
  /// pipelines, or if the receiver already has a source.
  pub fn subscribe(
    &self,
    receiver: &Arc<Receiver<T>>,
    policy: DeliveryPolicy<T>,
    allow_while_running: bool,
  ) -> PipelineResult<()> {
    if receiver.pipeline_id() != self.host.pipeline_id {
      return Err(PipelineError::CrossPipelineSubscription {
        emitter: format!("{}/{}", self.host.pipeline_name, self.name),
        receiver: receiver.name().to_string(),
      });
    }
    if self.host.is_running() && !allow_while_running {
      return Err(PipelineError::SubscribeWhileRunning {
        emitter: self.name.clone(),
        receiver: receiver.name().to_string(),
      });
    }
    receiver.bind_source(self.name.clone(), Arc::clone(&self.sync_lock), policy)?;
    let mut subscribers = self.subscribers.lock().unwrap();
    let mut list = (**subscribers).clone();
    list.push(Subscription {
      receiver: Arc::downgrade(receiver),
      receiver_id: receiver.id(),
    });
    *subscribers = Arc::new(list);
    debug!("{} subscribed to {}", receiver.name(), self.name);
    Ok(())
  }

  /// Removes `receiver` from the subscriber list. Idempotent; posts in
  /// flight are not blocked (the list is swapped copy-on-write).
  pub fn unsubscribe(&self, receiver: &Arc<Receiver<T>>) {
    let mut subscribers = self.subscribers.lock().unwrap();
    let list: Vec<Subscription<T>> = subscribers
      .iter()
      .filter(|s| s.receiver_id != receiver.id())
      .cloned()
      .collect();
    *subscribers = Arc::new(list);
    drop(subscribers);
    receiver.clear_source();
  }

  // ---------------------------------------------------------------------------

  /// Validates monotonicity and assigns the envelope.
  /// `Ok(None)` means the stream is closed and the call is a no-op.
  fn stamp(&self, originating_time: Time, closing: bool) -> PipelineResult<Option<Envelope>> {
    let now = self.host.scheduler.clock().now();
    let mut state = self.state.lock().unwrap();
    if state.closed {
      trace!("emitter {}: message after close ignored", self.name);
      return Ok(None);
    }
    if let Some(last) = &state.last_envelope {
      if originating_time <= last.originating_time {
        return Err(PipelineError::InvalidSequence {
          emitter: self.name.clone(),
          details: format!(
            "originating time {originating_time} does not advance past {}",
            last.originating_time
          ),
        });
      }
    }
    let sequence_id = if closing {
      CLOSING_SEQUENCE_ID
    } else {
      state.next_sequence_id
    };
    // Creation time never goes backwards, even if the clock was swapped.
    let creation_time = match &state.last_envelope {
      Some(last) if last.creation_time > now => last.creation_time,
      _ => now,
    };
    let envelope = Envelope::new(self.id, sequence_id, originating_time, creation_time);
    state.last_envelope = Some(envelope);
    if closing {
      state.closed = true;
    } else {
      state.next_sequence_id += 1;
    }
    Ok(Some(envelope))
  }

  /// Runs delivery on this thread if the emitter's lock is free and no
  /// earlier delivery is queued behind it, otherwise schedules it.
  /// `None` payload is the closing marker.
  fn deliver_or_queue(&self, payload: Option<T>, envelope: Envelope) {
    if self.pending_deliveries.load(Ordering::Acquire) == 0 {
      let executed = self.host.scheduler.try_execute(
        &self.sync_lock,
        envelope.originating_time,
        &self.host.context,
        || {
          self.deliver(payload.as_ref(), envelope);
          Ok(())
        },
      );
      if executed {
        return;
      }
    }
    self.pending_deliveries.fetch_add(1, Ordering::AcqRel);
    let this = self.self_weak.clone();
    self.host.scheduler.schedule_callback(
      Arc::clone(&self.sync_lock),
      envelope.originating_time,
      Arc::clone(&self.host.context),
      Box::new(move || {
        if let Some(emitter) = this.upgrade() {
          emitter.deliver(payload.as_ref(), envelope);
          emitter.pending_deliveries.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
      }),
    );
  }

  fn deliver(&self, payload: Option<&T>, envelope: Envelope) {
    let subscribers = self.subscribers.lock().unwrap().clone();
    for subscription in subscribers.iter() {
      if let Some(receiver) = subscription.receiver.upgrade() {
        match payload {
          Some(data) => receiver.receive(data, envelope),
          None => receiver.receive_closing(envelope),
        }
      }
    }
    if payload.is_none() {
      // The closing marker is out; nobody else will hear from us.
      *self.subscribers.lock().unwrap() = Arc::new(Vec::new());
    }
  }
}

/// Type-erased emitter view held by the pipeline registry.
pub(crate) trait ErasedEmitter: Send + Sync {
  fn id(&self) -> i32;
  fn name(&self) -> &str;
  fn type_name(&self) -> &'static str;
  fn last_originating_time(&self) -> Option<Time>;
  fn is_closed(&self) -> bool;
  /// Close at `time`, nudged forward if the emitter already posted past it.
  /// Returns the closing time actually used.
  fn close_at(&self, time: Time) -> Time;
}

impl<T: Clone + Send + 'static> ErasedEmitter for Emitter<T> {
  fn id(&self) -> i32 {
    self.id
  }

  fn name(&self) -> &str {
    &self.name
  }

  fn type_name(&self) -> &'static str {
    std::any::type_name::<T>()
  }

  fn last_originating_time(&self) -> Option<Time> {
    self.last_envelope().map(|e| e.originating_time)
  }

  fn is_closed(&self) -> bool {
    Emitter::is_closed(self)
  }

  fn close_at(&self, time: Time) -> Time {
    if self.is_closed() {
      return self.last_originating_time().unwrap_or(time);
    }
    let time = match self.last_originating_time() {
      Some(last) if time <= last => last + Duration::from_ticks(1),
      _ => time,
    };
    if let Err(e) = self.close(time) {
      error!("emitter {} failed to close: {e}", self.name);
    }
    time
  }
}
