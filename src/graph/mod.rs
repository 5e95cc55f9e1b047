//! Composition graph model and precomputed analysis.

pub mod analysis;
pub mod model;

pub use analysis::{Chain, GraphAnalysis, TriggerRef};
pub use model::{
    Cable, CableKind, Composition, CompositionMetadata, NodeInstance, PublishedPort,
    PUBLISHED_INPUT_TRIGGER_NAME, TOP_LEVEL_COMPOSITION_IDENTIFIER,
};
