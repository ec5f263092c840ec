use std::error::Error;

/// Errors produced by the pipeline core.
///
/// Component callbacks report failures by returning one of these; everything
/// else is raised by the core itself when a usage or ordering contract is
/// violated.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
  /// An emitter was asked to post a message that would violate the
  /// per-emitter monotonicity contract (sequence id, originating time or
  /// creation time going backwards).
  #[error("invalid sequence on emitter {emitter}: {details}")]
  InvalidSequence { emitter: String, details: String },

  /// A receiver was subscribed to an emitter that belongs to a different
  /// pipeline. Streams crossing pipeline boundaries must go through a
  /// bridging connector.
  #[error("cannot subscribe {receiver} to {emitter}: different pipelines")]
  CrossPipelineSubscription { emitter: String, receiver: String },

  /// Subscription was attempted while the pipeline is running and the
  /// caller did not opt in to late joining.
  #[error("cannot subscribe {receiver} to {emitter}: pipeline is already running")]
  SubscribeWhileRunning { emitter: String, receiver: String },

  /// The receiver already has a source stream.
  #[error("receiver {receiver} is already subscribed")]
  AlreadySubscribed { receiver: String },

  /// A synchronization lock was released more times than it was taken.
  /// This indicates a bug in the core, not in user code.
  #[error("synchronization lock released more times than acquired")]
  LockReleaseImbalance,

  /// A component callback failed. Routed through the installed error
  /// handler; escalates to `ForcedShutdown` if unhandled.
  #[error("component callback failed: {message}")]
  CallbackFailure {
    message: String,
    #[source]
    source: Option<Box<dyn Error + Send + Sync>>,
  },

  /// The pipeline was shut down because of an unrecovered error.
  #[error("pipeline forced shutdown: {cause}")]
  ForcedShutdown {
    #[source]
    cause: Box<PipelineError>,
  },

  /// `run`/`start` was called on a pipeline that is not in the
  /// `NotStarted` state.
  #[error("pipeline {name} has already been started")]
  AlreadyRunning { name: String },

  /// A source component failed to start or stop.
  #[error("source component {name} failed: {details}")]
  ComponentFailure { name: String, details: String },
}

impl PipelineError {
  /// Shorthand for a callback failure with a plain message.
  pub fn callback(message: impl Into<String>) -> Self {
    PipelineError::CallbackFailure {
      message: message.into(),
      source: None,
    }
  }

  /// Callback failure wrapping an underlying error.
  pub fn callback_with_source(
    message: impl Into<String>,
    source: impl Error + Send + Sync + 'static,
  ) -> Self {
    PipelineError::CallbackFailure {
      message: message.into(),
      source: Some(Box::new(source)),
    }
  }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
