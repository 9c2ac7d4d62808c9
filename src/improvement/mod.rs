//! Improvement chain: generate, gate, apply, validate

pub mod applier;
pub mod gate;
pub mod generator;
pub mod pipeline;
pub mod validation;

pub use applier::{merge_config, Applier};
pub use gate::{AgentCooldownState, CooldownGate, GateDecision, GateState, RejectReason, ReviewItem};
pub use generator::{classify_error_kind, generate, ErrorClass, GeneratorPolicy};
pub use pipeline::{ImprovementPipeline, PipelineOutcome};
pub use validation::{decide, ValidationController, ValidationPolicy};
