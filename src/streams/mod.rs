pub mod delivery_policy;
pub(crate) mod delivery_queue;
pub mod emitter;
pub mod receiver;
pub mod recycling;

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

pub use delivery_policy::{DeliveryPolicy, GuaranteeDelivery, DEFAULT_MAXIMUM_LATENCY};
pub use delivery_queue::QueueTransition;
pub use emitter::Emitter;
pub use receiver::Receiver;
pub use recycling::RecyclingPool;

use crate::scheduling::{context::SchedulerContext, scheduler::Scheduler};

/// Everything a stream endpoint needs from its owning pipeline.
pub(crate) struct StreamHost {
  pub pipeline_id: usize,
  pub pipeline_name: String,
  pub scheduler: Arc<Scheduler>,
  pub context: Arc<SchedulerContext>,
  running: AtomicBool,
}

impl StreamHost {
  pub fn new(
    pipeline_id: usize,
    pipeline_name: String,
    scheduler: Arc<Scheduler>,
    context: Arc<SchedulerContext>,
  ) -> StreamHost {
    StreamHost {
      pipeline_id,
      pipeline_name,
      scheduler,
      context,
      running: AtomicBool::new(false),
    }
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  pub fn set_running(&self, running: bool) {
    self.running.store(running, Ordering::Release);
  }
}
