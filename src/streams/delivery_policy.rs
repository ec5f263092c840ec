use std::{fmt, sync::Arc};

use crate::structure::time::Duration;

/// Predicate marking messages that must never be dropped by queue limits or
/// latency constraints.
pub type GuaranteeDelivery<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Per-receiver queueing contract, attached at subscribe time.
///
/// Immutable once attached. The presets below correspond to the recognized
/// policy names `Unlimited`, `LatestMessage`, `Throttle`,
/// `SynchronousOrThrottle` and `LatencyConstrained`.
pub struct DeliveryPolicy<T> {
  pub name: &'static str,
  /// Capacity the delivery queue is created with.
  pub initial_queue_size: usize,
  /// Hard bound on queued messages; the dropping rules kick in beyond it.
  pub maximum_queue_size: usize,
  /// Queue size at which the upstream emitter is frozen (and below which it
  /// is thawed again).
  pub throttle_queue_size: Option<usize>,
  /// Messages older than this at dequeue time are dropped unless guaranteed.
  pub maximum_latency: Option<Duration>,
  /// Whether the emitter may run the receiver callback on its own thread
  /// when the queue is empty and the receiver's lock is free.
  pub attempt_synchronous_delivery: bool,
  pub guarantee_delivery: Option<GuaranteeDelivery<T>>,
}

const DEFAULT_INITIAL_QUEUE_SIZE: usize = 16;

/// Default latency bound when `LatencyConstrained` is requested by name.
pub const DEFAULT_MAXIMUM_LATENCY: Duration = Duration::from_millis(100);

impl<T> DeliveryPolicy<T> {
  /// Queue without bounds; delivery attempted synchronously first.
  pub fn unlimited() -> DeliveryPolicy<T> {
    DeliveryPolicy {
      name: "Unlimited",
      initial_queue_size: DEFAULT_INITIAL_QUEUE_SIZE,
      maximum_queue_size: usize::MAX,
      throttle_queue_size: None,
      maximum_latency: None,
      attempt_synchronous_delivery: true,
      guarantee_delivery: None,
    }
  }

  /// Keep only the most recent message.
  pub fn latest_message() -> DeliveryPolicy<T> {
    DeliveryPolicy {
      name: "LatestMessage",
      initial_queue_size: 1,
      maximum_queue_size: 1,
      ..DeliveryPolicy::unlimited()
    }
  }

  /// Back-pressure the emitter as soon as a message is waiting.
  pub fn throttle() -> DeliveryPolicy<T> {
    DeliveryPolicy {
      name: "Throttle",
      throttle_queue_size: Some(1),
      attempt_synchronous_delivery: false,
      ..DeliveryPolicy::unlimited()
    }
  }

  /// Like `throttle`, but still try the synchronous fast path when the
  /// queue is empty.
  pub fn synchronous_or_throttle() -> DeliveryPolicy<T> {
    DeliveryPolicy {
      name: "SynchronousOrThrottle",
      throttle_queue_size: Some(1),
      attempt_synchronous_delivery: true,
      ..DeliveryPolicy::unlimited()
    }
  }

  /// Drop messages that would be delivered more than `latency` after their
  /// originating time.
  pub fn latency_constrained(latency: Duration) -> DeliveryPolicy<T> {
    DeliveryPolicy {
      name: "LatencyConstrained",
      maximum_latency: Some(latency),
      ..DeliveryPolicy::unlimited()
    }
  }

  /// Resolves one of the recognized policy names.
  /// `LatencyConstrained` gets `DEFAULT_MAXIMUM_LATENCY`.
  pub fn from_name(name: &str) -> Option<DeliveryPolicy<T>> {
    match name {
      "Unlimited" => Some(DeliveryPolicy::unlimited()),
      "LatestMessage" => Some(DeliveryPolicy::latest_message()),
      "Throttle" => Some(DeliveryPolicy::throttle()),
      "SynchronousOrThrottle" => Some(DeliveryPolicy::synchronous_or_throttle()),
      "LatencyConstrained" => Some(DeliveryPolicy::latency_constrained(DEFAULT_MAXIMUM_LATENCY)),
      _ => None,
    }
  }

  pub fn with_maximum_queue_size(mut self, maximum_queue_size: usize) -> DeliveryPolicy<T> {
    self.maximum_queue_size = maximum_queue_size;
    self
  }

  pub fn with_throttle_queue_size(mut self, throttle_queue_size: usize) -> DeliveryPolicy<T> {
    self.throttle_queue_size = Some(throttle_queue_size);
    self
  }

  pub fn with_guarantee_delivery(
    mut self,
    guarantee: impl Fn(&T) -> bool + Send + Sync + 'static,
  ) -> DeliveryPolicy<T> {
    self.guarantee_delivery = Some(Arc::new(guarantee));
    self
  }

  pub(crate) fn is_guaranteed(&self, data: &T) -> bool {
    match &self.guarantee_delivery {
      Some(g) => g(data),
      None => false,
    }
  }
}

// Not derived: deriving would put a `T: Clone` bound on the policy, and the
// predicate is shared, not cloned.
impl<T> Clone for DeliveryPolicy<T> {
  fn clone(&self) -> Self {
    DeliveryPolicy {
      name: self.name,
      initial_queue_size: self.initial_queue_size,
      maximum_queue_size: self.maximum_queue_size,
      throttle_queue_size: self.throttle_queue_size,
      maximum_latency: self.maximum_latency,
      attempt_synchronous_delivery: self.attempt_synchronous_delivery,
      guarantee_delivery: self.guarantee_delivery.clone(),
    }
  }
}

impl<T> Default for DeliveryPolicy<T> {
  fn default() -> Self {
    DeliveryPolicy::unlimited()
  }
}

impl<T> fmt::Debug for DeliveryPolicy<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DeliveryPolicy")
      .field("name", &self.name)
      .field("maximum_queue_size", &self.maximum_queue_size)
      .field("throttle_queue_size", &self.throttle_queue_size)
      .field("maximum_latency", &self.maximum_latency)
      .field(
        "attempt_synchronous_delivery",
        &self.attempt_synchronous_delivery,
      )
      .field("guaranteed", &self.guarantee_delivery.is_some())
      .finish()
  }
}
