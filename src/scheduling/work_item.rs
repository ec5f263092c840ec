use std::{fmt, sync::Arc};

use crate::{
  error::PipelineResult,
  scheduling::context::SchedulerContext,
  structure::time::Time,
  sync::lock::SynchronizationLock,
};

pub(crate) type WorkItemCallback = Box<dyn FnOnce() -> PipelineResult<()> + Send>;

/// One unit of scheduled work: run `callback` under `sync_lock`, no earlier
/// than `start_time`, accounted against `context`.
pub(crate) struct WorkItem {
  pub sync_lock: Arc<SynchronizationLock>,
  pub start_time: Time,
  pub callback: WorkItemCallback,
  pub context: Arc<SchedulerContext>,
}

impl WorkItem {
  pub fn new(
    sync_lock: Arc<SynchronizationLock>,
    start_time: Time,
    context: Arc<SchedulerContext>,
    callback: WorkItemCallback,
  ) -> WorkItem {
    WorkItem {
      sync_lock,
      start_time,
      callback,
      context,
    }
  }
}

impl fmt::Debug for WorkItem {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkItem")
      .field("start_time", &self.start_time)
      .finish_non_exhaustive()
  }
}
