use std::{
  collections::BTreeMap,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
  },
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  scheduling::{clock::Clock, work_item::WorkItem},
  structure::time::Time,
  sync::event::ManualResetEvent,
};

/// Time-ordered queue with a caller-supplied dequeue gate.
///
/// Entries with equal times dequeue in FIFO order (a monotonic insertion
/// counter breaks ties). `dequeue_if` walks the queue in order and removes
/// the first entry the gate accepts, so a gated-out head does not block
/// entries behind it.
pub(crate) struct PriorityQueue<T> {
  items: Mutex<BTreeMap<(Time, u64), T>>,
  next_seq: AtomicU64,
  empty: ManualResetEvent,
}

impl<T> PriorityQueue<T> {
  pub fn new() -> PriorityQueue<T> {
    PriorityQueue {
      items: Mutex::new(BTreeMap::new()),
      next_seq: AtomicU64::new(0),
      empty: ManualResetEvent::new(true),
    }
  }

  pub fn enqueue(&self, time: Time, item: T) {
    let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
    let mut items = self.items.lock().unwrap();
    items.insert((time, seq), item);
    self.empty.reset();
  }

  /// Removes and returns the first entry (in time order) accepted by
  /// `gate`. The gate must be cheap; it runs under the queue lock.
  pub fn dequeue_if(&self, mut gate: impl FnMut(&T) -> bool) -> Option<T> {
    let mut items = self.items.lock().unwrap();
    let key = items
      .iter()
      .find(|(_, item)| gate(item))
      .map(|(key, _)| *key)?;
    let item = items.remove(&key);
    if items.is_empty() {
      self.empty.set();
    }
    item
  }

  /// Time of the earliest entry.
  pub fn peek_time(&self) -> Option<Time> {
    self.items.lock().unwrap().keys().next().map(|(t, _)| *t)
  }

  /// Time of the earliest entry accepted by `gate`.
  pub fn peek_time_if(&self, mut gate: impl FnMut(&T) -> bool) -> Option<Time> {
    self
      .items
      .lock()
      .unwrap()
      .iter()
      .find(|(_, item)| gate(item))
      .map(|((t, _), _)| *t)
  }

  pub fn len(&self) -> usize {
    self.items.lock().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.lock().unwrap().is_empty()
  }

  /// Removes everything, in order.
  pub fn drain(&self) -> Vec<T> {
    let mut items = self.items.lock().unwrap();
    let drained = std::mem::take(&mut *items);
    self.empty.set();
    drained.into_values().collect()
  }

  pub fn empty_event(&self) -> &ManualResetEvent {
    &self.empty
  }
}

// ----------------------------------------------------------------------------

/// Ready work items. The dequeue gate takes the item's lock; on success the
/// caller owns the lock until it releases the executed action.
pub(crate) struct WorkItemQueue {
  queue: PriorityQueue<WorkItem>,
}

impl WorkItemQueue {
  pub fn new() -> WorkItemQueue {
    WorkItemQueue {
      queue: PriorityQueue::new(),
    }
  }

  pub fn enqueue(&self, item: WorkItem) {
    self.queue.enqueue(item.start_time, item);
  }

  /// Dequeues the earliest item whose lock can be taken.
  pub fn try_dequeue(&self) -> Option<WorkItem> {
    self.queue.dequeue_if(|wi| wi.sync_lock.try_lock())
  }

  pub fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  pub fn len(&self) -> usize {
    self.queue.len()
  }

  pub fn drain(&self) -> Vec<WorkItem> {
    self.queue.drain()
  }
}

/// Work items not yet due under the virtual clock. Owned by the futures
/// thread, which releases items as their start times arrive.
pub(crate) struct FutureWorkItemQueue {
  queue: PriorityQueue<WorkItem>,
}

impl FutureWorkItemQueue {
  pub fn new() -> FutureWorkItemQueue {
    FutureWorkItemQueue {
      queue: PriorityQueue::new(),
    }
  }

  pub fn enqueue(&self, item: WorkItem) {
    self.queue.enqueue(item.start_time, item);
  }

  /// Dequeues the next item that is due, or that no longer needs delaying:
  /// either the clock has caught up with it, or due-time delays are
  /// disabled, or it lies past its context's finalize time, or its context
  /// has stopped (in the latter cases the dispatch path drops the item and
  /// exits the context). Items of never-started contexts stay buffered.
  pub fn dequeue_ready(&self, clock: &Arc<Clock>, delay_until_due: bool) -> Option<WorkItem> {
    let now = clock.now();
    self.queue.dequeue_if(|wi| {
      wi.context.is_stopped()
        || (wi.context.is_started()
          && (wi.start_time <= now
            || !delay_until_due
            || wi.start_time > wi.context.finalize_time()))
    })
  }

  /// Earliest start time among items whose context has started scheduling.
  /// Items of not-yet-started contexts stay buffered and do not drive the
  /// futures-thread wakeup.
  pub fn next_schedulable_time(&self) -> Option<Time> {
    self.queue.peek_time_if(|wi| wi.context.is_started())
  }

  pub fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  pub fn len(&self) -> usize {
    self.queue.len()
  }

  pub fn drain(&self) -> Vec<WorkItem> {
    self.queue.drain()
  }
}
