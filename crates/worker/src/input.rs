//! Preprocessed tensor data handed from the preprocessing stage to the engine

use crate::engine::{EngineResult, InferenceEngine};

/// Normalised planar image, one `height * width` plane per channel
///
/// Loads itself into an engine slot without knowing which backend runs.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineInputData {
    planes: Vec<Vec<f32>>,
}

impl EngineInputData {
    /// Wrap channel planes
    pub fn new(planes: Vec<Vec<f32>>) -> Self {
        Self { planes }
    }

    /// Channel planes in engine order
    pub fn planes(&self) -> &[Vec<f32>] {
        &self.planes
    }

    /// Total number of values across all planes
    pub fn len(&self) -> usize {
        self.planes.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the planes back to back into slot `slot` of `engine`
    pub fn load_into(&self, slot: usize, engine: &mut dyn InferenceEngine) -> EngineResult<()> {
        let mut offset = 0;
        for plane in &self.planes {
            engine.load_to_input(slot, offset, plane)?;
            offset += plane.len();
        }
        Ok(())
    }
}
