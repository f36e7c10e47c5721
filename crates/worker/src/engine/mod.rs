//! Inference engine contract and backend registry
//!
//! The batching worker drives an engine through three calls: load every slot of
//! the batch, infer, unload the outputs. Backends only implement that contract;
//! which backend runs is decided once at startup by the [`EngineRegistry`].

pub mod linear;
pub mod synthetic;

pub use linear::LinearEngine;
pub use synthetic::SyntheticEngine;

use skinscan_common::config::EngineSettings;
use skinscan_common::{Result, ServiceError};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, info};

/// Errors reported by engine calls
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("batch slot {batch} out of range, max batches {max}")]
    SlotOutOfRange { batch: usize, max: usize },

    #[error("input of {n} values at offset {offset} overflows slot of {capacity}")]
    InputOverflow {
        offset: usize,
        n: usize,
        capacity: usize,
    },

    #[error("batch count {batches} must be in 1..={max}")]
    InvalidBatchCount { batches: usize, max: usize },

    #[error("output buffer holds {got} values, {needed} required")]
    OutputTooSmall { needed: usize, got: usize },

    #[error("unload of {requested} batches after inferring {inferred}")]
    NotInferred { requested: usize, inferred: usize },

    #[error("backend failure: {0}")]
    Backend(String),
}

/// Result type for engine calls
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Neural network forward pass over a fixed-capacity batch
///
/// Engines are stateful (one input and one output region sized for
/// `max_batches`) and are driven from one thread at a time.
pub trait InferenceEngine: Send {
    /// Maximum number of slots one `infer` call can process
    fn max_batches(&self) -> usize;

    fn input_width(&self) -> usize;

    fn input_height(&self) -> usize;

    fn input_channels(&self) -> usize;

    /// Number of values produced per slot
    fn output_size(&self) -> usize;

    /// Number of input values in one slot
    fn batch_input_n(&self) -> usize {
        self.input_width() * self.input_height() * self.input_channels()
    }

    /// Number of output values in one slot
    fn batch_output_n(&self) -> usize {
        self.output_size()
    }

    /// Output position of the positive score
    fn positive_index(&self) -> usize;

    /// Output position of the negative score
    fn negative_index(&self) -> usize;

    /// Copy `src` into slot `batch` starting at element `offset`
    fn load_to_input(&mut self, batch: usize, offset: usize, src: &[f32]) -> EngineResult<()>;

    /// Run the forward pass over slots `0..batches`
    fn infer(&mut self, batches: usize) -> EngineResult<()>;

    /// Copy the outputs of slots `0..batches` into `dst`
    fn unload_output(&mut self, batches: usize, dst: &mut [f32]) -> EngineResult<()>;
}

impl fmt::Debug for dyn InferenceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("max_batches", &self.max_batches())
            .field(
                "input",
                &(self.input_channels(), self.input_height(), self.input_width()),
            )
            .field("output_size", &self.output_size())
            .finish()
    }
}

/// Shared argument checks for `load_to_input`
pub fn validate_load_input<E: InferenceEngine + ?Sized>(
    engine: &E,
    batch: usize,
    offset: usize,
    n: usize,
) -> EngineResult<()> {
    if batch >= engine.max_batches() {
        return Err(EngineError::SlotOutOfRange {
            batch,
            max: engine.max_batches(),
        });
    }

    let capacity = engine.batch_input_n();
    if offset >= capacity || n > capacity - offset {
        return Err(EngineError::InputOverflow { offset, n, capacity });
    }

    Ok(())
}

/// Shared argument checks for `infer`
pub fn validate_infer<E: InferenceEngine + ?Sized>(engine: &E, batches: usize) -> EngineResult<()> {
    if batches == 0 || batches > engine.max_batches() {
        return Err(EngineError::InvalidBatchCount {
            batches,
            max: engine.max_batches(),
        });
    }

    Ok(())
}

/// Shared argument checks for `unload_output`
pub fn validate_unload_output<E: InferenceEngine + ?Sized>(
    engine: &E,
    batches: usize,
    dst: &[f32],
) -> EngineResult<()> {
    validate_infer(engine, batches)?;

    let needed = batches * engine.batch_output_n();
    if dst.len() < needed {
        return Err(EngineError::OutputTooSmall {
            needed,
            got: dst.len(),
        });
    }

    Ok(())
}

/// Builds an engine from validated settings
pub type EngineConstructor =
    Box<dyn Fn(&EngineSettings) -> Result<Box<dyn InferenceEngine>> + Send + Sync>;

/// Backend constructors keyed by the settings `type` string
///
/// Built at startup and handed to the service; there is no global registry.
pub struct EngineRegistry {
    constructors: HashMap<String, EngineConstructor>,
}

impl EngineRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Create a registry with the backends shipped in this crate
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("linear", |settings| {
            Ok(Box::new(LinearEngine::load(settings)?) as Box<dyn InferenceEngine>)
        });
        registry.register("synthetic", |settings| {
            Ok(Box::new(SyntheticEngine::load(settings)?) as Box<dyn InferenceEngine>)
        });
        registry
    }

    /// Register (or replace) the constructor for a backend type
    pub fn register<F>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(&EngineSettings) -> Result<Box<dyn InferenceEngine>> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Box::new(constructor));
    }

    /// Registered backend types
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Validate the settings, build the configured backend and check that the
    /// score indexes fit its output
    pub fn create(&self, settings: &EngineSettings) -> Result<Box<dyn InferenceEngine>> {
        settings.validate()?;

        let kind = settings.kind();
        let constructor = self.constructors.get(kind).ok_or_else(|| {
            ServiceError::engine(format!("Cannot create tensor engine by type: {}", kind))
        })?;

        let engine = constructor(settings)?;

        if engine.max_batches() == 0 {
            return Err(ServiceError::engine("Engine reports zero max batches"));
        }

        if engine.positive_index() == engine.negative_index() {
            error!("Engine positive and negative indexes are equal");
            return Err(ServiceError::engine(
                "Positive and negative output indexes must differ",
            ));
        }

        let output_size = engine.output_size();
        if engine.positive_index() >= output_size || engine.negative_index() >= output_size {
            error!(
                "Invalid indexes for output: positive={}, negative={}, output size={}",
                engine.positive_index(),
                engine.negative_index(),
                output_size
            );
            return Err(ServiceError::engine(format!(
                "Output indexes {} and {} must be less than output size {}",
                engine.positive_index(),
                engine.negative_index(),
                output_size
            )));
        }

        info!(
            "Tensor engine '{}' loaded: max batches {}, input {}x{}x{}, output {}",
            kind,
            engine.max_batches(),
            engine.input_channels(),
            engine.input_height(),
            engine.input_width(),
            output_size
        );

        Ok(engine)
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skinscan_common::config::{BackendSettings, SyntheticSettings};

    fn synthetic_settings(output: usize, positive: usize, negative: usize) -> EngineSettings {
        EngineSettings {
            max_batches: 4,
            positive_index: positive,
            negative_index: negative,
            count_tests_for_estimate: 1,
            backend: BackendSettings::Synthetic(SyntheticSettings {
                width: 4,
                height: 4,
                channels: 3,
                output,
                infer_delay_ms: 0,
            }),
        }
    }

    #[test]
    fn test_registry_builtin_kinds() {
        let registry = EngineRegistry::with_builtin();
        assert_eq!(registry.kinds(), vec!["linear", "synthetic"]);
    }

    #[test]
    fn test_registry_creates_synthetic() {
        let registry = EngineRegistry::with_builtin();
        let engine = registry.create(&synthetic_settings(2, 0, 1)).unwrap();
        assert_eq!(engine.max_batches(), 4);
        assert_eq!(engine.batch_input_n(), 48);
        assert_eq!(engine.batch_output_n(), 2);
    }

    #[test]
    fn test_registry_rejects_equal_indexes() {
        let registry = EngineRegistry::with_builtin();
        assert!(registry.create(&synthetic_settings(2, 1, 1)).is_err());
    }

    #[test]
    fn test_registry_rejects_index_out_of_output() {
        let registry = EngineRegistry::with_builtin();
        let result = registry.create(&synthetic_settings(2, 0, 2));
        assert!(matches!(result, Err(ServiceError::Engine(_))));
    }

    #[test]
    fn test_registry_unknown_kind() {
        let registry = EngineRegistry::new();
        let result = registry.create(&synthetic_settings(2, 0, 1));
        assert!(matches!(result, Err(ServiceError::Engine(_))));
    }

    #[test]
    fn test_validate_helpers() {
        let registry = EngineRegistry::with_builtin();
        let engine = registry.create(&synthetic_settings(2, 0, 1)).unwrap();

        assert!(validate_load_input(engine.as_ref(), 3, 0, 48).is_ok());
        assert!(validate_load_input(engine.as_ref(), 0, 16, 32).is_ok());
        assert_eq!(
            validate_load_input(engine.as_ref(), 4, 0, 1),
            Err(EngineError::SlotOutOfRange { batch: 4, max: 4 })
        );
        assert!(validate_load_input(engine.as_ref(), 0, 48, 1).is_err());
        assert!(validate_load_input(engine.as_ref(), 0, 16, 33).is_err());

        assert!(validate_infer(engine.as_ref(), 0).is_err());
        assert!(validate_infer(engine.as_ref(), 5).is_err());

        let dst = vec![0.0; 3];
        assert_eq!(
            validate_unload_output(engine.as_ref(), 2, &dst),
            Err(EngineError::OutputTooSmall { needed: 4, got: 3 })
        );
    }
}
