use serde::{Deserialize, Serialize};

/// What an attached image contributed to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageFacts {
    #[serde(default)]
    pub observations: Vec<String>,
    #[serde(default)]
    pub extracted_text: String,
}

/// Gate classification of a live message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub consider: bool,
    pub tag: GateTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateTag {
    NewQuestion,
    OngoingDiscussion,
    Statement,
    Noise,
}

impl GateDecision {
    /// `consider` may only be true for a question or an ongoing discussion;
    /// the model is not trusted to keep the two fields coherent.
    pub fn normalized(mut self) -> Self {
        if !matches!(self.tag, GateTag::NewQuestion | GateTag::OngoingDiscussion) {
            self.consider = false;
        }
        self
    }
}

/// One candidate case span over the numbered buffer blocks, inclusive ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRange {
    pub start_idx: usize,
    pub end_idx: usize,
}

/// Check that spans are individually well-formed, in range for
/// `block_count`, sorted ascending, and pairwise non-overlapping.
/// Any violation rejects the entire set.
pub fn validate_spans(spans: &[SpanRange], block_count: usize) -> std::result::Result<(), String> {
    let mut prev_end: Option<usize> = None;
    for s in spans {
        if s.start_idx > s.end_idx {
            return Err(format!("span {}..{} is inverted", s.start_idx, s.end_idx));
        }
        if s.end_idx >= block_count {
            return Err(format!(
                "span {}..{} out of range for {} blocks",
                s.start_idx, s.end_idx, block_count
            ));
        }
        if let Some(prev) = prev_end {
            if s.start_idx <= prev {
                return Err(format!(
                    "span {}..{} overlaps or is unsorted after end {}",
                    s.start_idx, s.end_idx, prev
                ));
            }
        }
        prev_end = Some(s.end_idx);
    }
    Ok(())
}

/// Case status as proposed by the model for a structured span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposedStatus {
    Open,
    Solved,
}

/// Structured view of one case block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseStructure {
    pub keep: bool,
    pub status: ProposedStatus,
    #[serde(default)]
    pub problem_title: String,
    #[serde(default)]
    pub problem_summary: String,
    #[serde(default)]
    pub solution_summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CaseStructure {
    /// A solved verdict without a solution text is demoted to open.
    pub fn normalized(mut self) -> Self {
        if self.status == ProposedStatus::Solved && self.solution_summary.trim().is_empty() {
            self.status = ProposedStatus::Open;
        }
        self
    }
}

/// Result of checking an open case against the current buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionCheck {
    pub resolved: bool,
    #[serde(default)]
    pub solution_summary: String,
}

impl ResolutionCheck {
    /// "Resolved" with no solution text is treated as not resolved.
    pub fn normalized(mut self) -> Self {
        if self.resolved && self.solution_summary.trim().is_empty() {
            self.resolved = false;
        }
        self
    }
}
