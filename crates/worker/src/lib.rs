//! SkinScan Worker
//!
//! Two-stage image classification pipeline: a preprocessing thread pool turns
//! submitted images into engine input, and a single batching thread runs the
//! inference engine over up to `maxBatches` requests at a time.

pub mod batching;
pub mod engine;
pub mod estimate;
pub mod events;
pub mod input;
pub mod lifecycle;
pub mod preprocess;
pub mod service;
pub mod tensor;

pub use batching::BatchingWorker;
pub use engine::{EngineError, EngineRegistry, InferenceEngine};
pub use estimate::{Estimate, LatencyEstimator};
pub use events::EventSink;
pub use input::EngineInputData;
pub use lifecycle::WorkerState;
pub use preprocess::{ConvertError, ImageConverter, ImageConvertor, Payload, PreprocessingPool};
pub use service::Service;
