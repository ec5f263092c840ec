//! Chronopipe is a deterministic virtual-time runtime for streaming
//! pipelines of time-aligned sensor and media data.
//!
//! A pipeline is a directed graph of stateful components communicating by
//! typed streams. Components own [`Emitter`]/[`Receiver`] endpoints; every
//! message carries an [`Envelope`] with its originating (virtual) time, and
//! for any one receiver, callbacks always run in strictly increasing
//! originating-time order. Per-receiver [`DeliveryPolicy`]s control
//! queueing, latency bounds and back-pressure (expressed by freezing the
//! upstream emitter, never by blocking a posting thread).
//!
//! Scheduling runs against a virtual [`Clock`](scheduling::Clock): live
//! pipelines track real time, replays run paced (dilation 1.0) or as fast
//! as possible (a frozen clock), chosen through the [`ReplayDescriptor`]
//! handed to [`Pipeline::run`].
//!
//! ```no_run
//! use chronopipe::{
//!   DeliveryPolicy, Pipeline, PipelineOptions, ReplayDescriptor, Time,
//! };
//!
//! let pipeline = Pipeline::new(PipelineOptions::default());
//! let generator = pipeline.add_element("generator");
//! let printer = pipeline.add_element("printer");
//!
//! let out = pipeline.create_emitter::<i64>(&generator, "out");
//! let input = pipeline.create_receiver::<i64, _>(&printer, "in", |value, envelope| {
//!   println!("{value} at {}", envelope.originating_time);
//!   Ok(())
//! });
//! out.subscribe(&input, DeliveryPolicy::unlimited(), false)?;
//!
//! pipeline.start(ReplayDescriptor::real_time())?;
//! out.post(1, Time::now())?;
//! pipeline.stop(false);
//! # Ok::<(), chronopipe::PipelineError>(())
//! ```

pub mod error;
pub mod pipeline;
pub mod scheduling;
pub mod streams;
pub mod structure;
pub mod sync;

pub use error::{PipelineError, PipelineResult};
pub use pipeline::{
  Consumer, ConsumerProducer, ElementState, Pipeline, PipelineDiagnostics, PipelineElement,
  PipelineOptions, PipelineState, Producer, ReplayDescriptor, SourceComponent,
};
pub use scheduling::{Clock, SchedulerDiagnostics, SchedulerOptions};
pub use streams::{
  DeliveryPolicy, Emitter, QueueTransition, Receiver, RecyclingPool, DEFAULT_MAXIMUM_LATENCY,
};
pub use structure::{Duration, Envelope, Message, Time, TimeInterval, CLOSING_SEQUENCE_ID};
