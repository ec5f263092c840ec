pub mod element;
#[allow(clippy::module_inception)]
pub mod pipeline;
pub mod replay;

pub use element::{
  Consumer, ConsumerProducer, ElementState, PipelineElement, Producer, SourceComponent,
};
pub use pipeline::{
  Pipeline, PipelineDiagnostics, PipelineOptions, PipelineState, ReceiverDiagnostics,
};
pub use replay::ReplayDescriptor;
