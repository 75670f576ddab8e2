use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use opora_core::types::Lang;

use crate::client::{ImageData, LlmClient};
use crate::error::{LlmError, Result};
use crate::prompts;
use crate::types::{
    validate_spans, CaseStructure, GateDecision, ImageFacts, ResolutionCheck, SpanRange,
};

/// The typed calls the pipeline makes against the LLM.
///
/// Implemented by [`LlmClient`] for production and by in-memory mocks in
/// the pipeline tests. Every method returns a validated value — callers
/// never see raw model text except from `synthesize_answer`.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn image_to_text(
        &self,
        image: &ImageData,
        context_text: &str,
    ) -> Result<ImageFacts>;

    async fn gate_classify(
        &self,
        message: &str,
        recent_context: &str,
        images: &[ImageData],
    ) -> Result<GateDecision>;

    /// Extract candidate case spans from a numbered buffer with
    /// `block_count` blocks. An out-of-range, unsorted, or overlapping
    /// result is rejected whole as `InvalidSpans`.
    async fn extract_case_spans(
        &self,
        numbered_buffer: &str,
        block_count: usize,
    ) -> Result<Vec<SpanRange>>;

    async fn structure_case(&self, case_block_text: &str) -> Result<CaseStructure>;

    async fn check_resolved(
        &self,
        case_title: &str,
        case_problem: &str,
        buffer_text: &str,
    ) -> Result<ResolutionCheck>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Free-text answer synthesis. The `[[TAG_ADMIN]]` sentinel contract is
    /// the caller's to enforce on the context side; this call only relays.
    async fn synthesize_answer(
        &self,
        question: &str,
        retrieved_context: &str,
        lang: Lang,
    ) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct SpanEnvelope {
    #[serde(default)]
    spans: Vec<SpanRange>,
}

#[async_trait]
impl LlmGateway for LlmClient {
    async fn image_to_text(
        &self,
        image: &ImageData,
        context_text: &str,
    ) -> Result<ImageFacts> {
        let user = prompts::image_user(context_text);
        self.chat_json(
            prompts::IMAGE_SYSTEM,
            &user,
            std::slice::from_ref(image),
        )
        .await
    }

    async fn gate_classify(
        &self,
        message: &str,
        recent_context: &str,
        images: &[ImageData],
    ) -> Result<GateDecision> {
        let user = prompts::gate_user(message, recent_context);
        let decision: GateDecision = self
            .chat_json(prompts::GATE_SYSTEM, &user, images)
            .await?;
        Ok(decision.normalized())
    }

    async fn extract_case_spans(
        &self,
        numbered_buffer: &str,
        block_count: usize,
    ) -> Result<Vec<SpanRange>> {
        let envelope: SpanEnvelope = self
            .chat_json(prompts::SPANS_SYSTEM, numbered_buffer, &[])
            .await?;
        validate_spans(&envelope.spans, block_count).map_err(LlmError::InvalidSpans)?;
        debug!(spans = envelope.spans.len(), "case spans extracted");
        Ok(envelope.spans)
    }

    async fn structure_case(&self, case_block_text: &str) -> Result<CaseStructure> {
        let structure: CaseStructure = self
            .chat_json(prompts::STRUCTURE_SYSTEM, case_block_text, &[])
            .await?;
        Ok(structure.normalized())
    }

    async fn check_resolved(
        &self,
        case_title: &str,
        case_problem: &str,
        buffer_text: &str,
    ) -> Result<ResolutionCheck> {
        let user = prompts::resolve_user(case_title, case_problem, buffer_text);
        let check: ResolutionCheck = self
            .chat_json(prompts::RESOLVE_SYSTEM, &user, &[])
            .await?;
        Ok(check.normalized())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_text(text).await
    }

    async fn synthesize_answer(
        &self,
        question: &str,
        retrieved_context: &str,
        lang: Lang,
    ) -> Result<String> {
        let system = prompts::answer_system(&lang.to_string());
        let user = prompts::answer_user(question, retrieved_context);
        let reply = self.chat(&system, &user, &[], false).await?;
        Ok(reply.trim().to_string())
    }
}
