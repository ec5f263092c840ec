use std::{collections::VecDeque, sync::Mutex};

use enumflags2::{bitflags, BitFlags};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  streams::{delivery_policy::DeliveryPolicy, recycling::RecyclingPool},
  structure::{envelope::Envelope, time::Time},
};

/// State transitions reported by every enqueue/dequeue. The receiver acts
/// on these: `ToNotEmpty`/`ToClosing` trigger delivery scheduling,
/// `ToStartThrottling`/`ToStopThrottling` freeze and thaw the upstream
/// emitter.
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueTransition {
  ToEmpty = 0b0000_0001,
  ToNotEmpty = 0b0000_0010,
  ToStartThrottling = 0b0000_0100,
  ToStopThrottling = 0b0000_1000,
  ToClosing = 0b0001_0000,
}

/// A queued message; `data == None` marks the closing sentinel.
pub(crate) struct QueueEntry<T> {
  pub data: Option<T>,
  pub envelope: Envelope,
}

struct Inner<T> {
  policy: DeliveryPolicy<T>,
  items: VecDeque<QueueEntry<T>>,
  throttling: bool,
  dropped: u64,
  latency_dropped: u64,
}

/// Per-receiver bounded FIFO applying a delivery policy.
pub(crate) struct DeliveryQueue<T> {
  inner: Mutex<Inner<T>>,
}

impl<T: Clone> DeliveryQueue<T> {
  pub fn new(policy: DeliveryPolicy<T>) -> DeliveryQueue<T> {
    let capacity = policy.initial_queue_size;
    DeliveryQueue {
      inner: Mutex::new(Inner {
        policy,
        items: VecDeque::with_capacity(capacity),
        throttling: false,
        dropped: 0,
        latency_dropped: 0,
      }),
    }
  }

  /// Replaces the policy; called once, at subscribe time, before any
  /// message flows.
  pub fn set_policy(&self, policy: DeliveryPolicy<T>) {
    let mut inner = self.inner.lock().unwrap();
    inner.items.reserve(policy.initial_queue_size);
    inner.policy = policy;
  }

  pub fn attempts_synchronous_delivery(&self) -> bool {
    self.inner.lock().unwrap().policy.attempt_synchronous_delivery
  }

  pub fn is_empty(&self) -> bool {
    self.inner.lock().unwrap().items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.inner.lock().unwrap().items.len()
  }

  pub fn dropped_count(&self) -> u64 {
    let inner = self.inner.lock().unwrap();
    inner.dropped + inner.latency_dropped
  }

  /// `on_throttle` is invoked under the queue lock when the size crosses
  /// the throttle threshold (`true` = start throttling). Running it under
  /// the lock keeps freeze/thaw applications in crossing order across
  /// threads.
  pub fn enqueue(
    &self,
    entry: QueueEntry<T>,
    pool: &RecyclingPool<T>,
    on_throttle: impl FnOnce(bool),
  ) -> BitFlags<QueueTransition> {
    let mut inner = self.inner.lock().unwrap();
    let was_empty = inner.items.is_empty();
    let mut flags = BitFlags::empty();

    if entry.envelope.is_closing() {
      // A closing message is never dropped, and obsoletes everything queued
      // after its originating time.
      let closing_time = entry.envelope.originating_time;
      let mut kept = VecDeque::with_capacity(inner.items.len());
      let mut purged = 0;
      for queued in inner.items.drain(..) {
        if queued.envelope.originating_time <= closing_time {
          kept.push_back(queued);
        } else {
          purged += 1;
          recycle_entry(queued, pool);
        }
      }
      inner.items = kept;
      inner.dropped += purged;
      inner.items.push_back(entry);
      flags |= QueueTransition::ToClosing;
    } else if inner.items.len() >= inner.policy.maximum_queue_size {
      match inner.policy.guarantee_delivery.clone() {
        None => {
          // No guarantees: the oldest message makes room.
          if let Some(old) = inner.items.pop_front() {
            inner.dropped += 1;
            recycle_entry(old, pool);
          }
          inner.items.push_back(entry);
        }
        Some(guarantee) => {
          let incoming_guaranteed = match &entry.data {
            Some(data) => guarantee(data),
            None => false,
          };
          if inner.items.len() > inner.policy.maximum_queue_size {
            // Already over-full with guaranteed messages: the incoming one
            // is dropped unless it is itself guaranteed.
            if incoming_guaranteed {
              inner.items.push_back(entry);
            } else {
              inner.dropped += 1;
              recycle_entry(entry, pool);
            }
          } else {
            // Exactly full: drop the first non-guaranteed, non-closing
            // message, if any.
            let victim = inner.items.iter().position(|queued| {
              !queued.envelope.is_closing()
                && matches!(&queued.data, Some(data) if !guarantee(data))
            });
            match victim {
              Some(index) => {
                if let Some(old) = inner.items.remove(index) {
                  inner.dropped += 1;
                  recycle_entry(old, pool);
                }
                inner.items.push_back(entry);
              }
              None if incoming_guaranteed => inner.items.push_back(entry),
              None => {
                inner.dropped += 1;
                recycle_entry(entry, pool);
              }
            }
          }
        }
      }
    } else {
      inner.items.push_back(entry);
    }

    if was_empty && !inner.items.is_empty() {
      flags |= QueueTransition::ToNotEmpty;
    }
    if let Some(threshold) = inner.policy.throttle_queue_size {
      if !inner.throttling && inner.items.len() >= threshold {
        inner.throttling = true;
        flags |= QueueTransition::ToStartThrottling;
        on_throttle(true);
      }
    }
    flags
  }

  /// Pops the next deliverable message. Messages violating the latency
  /// bound are recycled on the way. Also reports the originating time of
  /// the entry that is next after the returned one, for scheduling the
  /// following delivery.
  pub fn dequeue(
    &self,
    now: Time,
    pool: &RecyclingPool<T>,
    on_throttle: impl FnOnce(bool),
  ) -> (Option<QueueEntry<T>>, BitFlags<QueueTransition>, Option<Time>) {
    let mut inner = self.inner.lock().unwrap();
    let mut flags = BitFlags::empty();
    let result = loop {
      match inner.items.pop_front() {
        None => break None,
        Some(entry) => {
          if entry.envelope.is_closing() {
            break Some(entry);
          }
          let expired = match inner.policy.maximum_latency {
            Some(latency) => now - entry.envelope.originating_time > latency,
            None => false,
          };
          let guaranteed = matches!(&entry.data, Some(data) if inner.policy.is_guaranteed(data));
          if expired && !guaranteed {
            inner.latency_dropped += 1;
            recycle_entry(entry, pool);
            continue;
          }
          break Some(entry);
        }
      }
    };
    if result.is_some() && inner.items.is_empty() {
      flags |= QueueTransition::ToEmpty;
    }
    if let Some(threshold) = inner.policy.throttle_queue_size {
      if inner.throttling && inner.items.len() < threshold {
        inner.throttling = false;
        flags |= QueueTransition::ToStopThrottling;
        on_throttle(false);
      }
    }
    let next_time = inner.items.front().map(|e| e.envelope.originating_time);
    (result, flags, next_time)
  }
}

fn recycle_entry<T: Clone>(entry: QueueEntry<T>, pool: &RecyclingPool<T>) {
  if let Some(data) = entry.data {
    pool.recycle(data);
  }
}
