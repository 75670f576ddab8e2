//! Typed LLM gateway: every call site gets either a validated schema
//! instance or a typed failure — free text never leaks past this crate
//! except from the answer synthesizer, whose output is a reply by design.
//!
//! Prompt wording lives in `prompts` as data; the semantics the pipeline
//! relies on (span bounds, solved-implies-solution, the `[[TAG_ADMIN]]`
//! sentinel) are enforced post-hoc in `gateway`, not by the prompts.

pub mod client;
pub mod error;
pub mod gateway;
pub mod limiter;
pub mod prompts;
pub mod types;

pub use client::{ImageData, LlmClient};
pub use error::{LlmError, Result};
pub use gateway::LlmGateway;
pub use types::{
    CaseStructure, GateDecision, GateTag, ImageFacts, ProposedStatus, ResolutionCheck, SpanRange,
};

/// Sentinel a synthesized reply carries when human admins should be
/// mentioned instead of (or in addition to) an answer.
pub const TAG_ADMIN: &str = "[[TAG_ADMIN]]";
