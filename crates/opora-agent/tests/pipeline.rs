//! End-to-end pipeline scenarios over the real store, index and buffer,
//! with scripted LLM and transport doubles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use opora_agent::deps::{Deps, GroupLocks, HistoryNotifier, Transport, TransportError};
use opora_agent::{admin, answer, extractor, history, ingest, reactions};
use opora_core::config::*;
use opora_core::event::{InboundMessage, InboundReaction};
use opora_core::types::{Case, CaseId, CaseStatus, GroupId};
use opora_index::CaseIndex;
use opora_llm::types::{
    validate_spans, CaseStructure, GateDecision, GateTag, ImageFacts, ProposedStatus,
    ResolutionCheck, SpanRange,
};
use opora_llm::{ImageData, LlmError, LlmGateway};
use opora_queue::JobQueue;
use opora_store::Store;

const DIM: usize = 16;

/// Deterministic fallback embedding: near-one-hot by a simple text hash, so
/// unrelated texts land on (mostly) different axes.
fn hash_embedding(text: &str) -> Vec<f32> {
    let mut h: u64 = 1469598103934665603;
    for b in text.bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(1099511628211);
    }
    let mut v = vec![0.05f32; DIM];
    v[(h % DIM as u64) as usize] = 1.0;
    v
}

#[derive(Default)]
struct MockLlm {
    /// Popped front-first by successive extract_case_spans calls.
    spans: Mutex<Vec<Vec<SpanRange>>>,
    structures: Mutex<Vec<CaseStructure>>,
    resolutions: Mutex<Vec<ResolutionCheck>>,
    gate: Mutex<Option<GateDecision>>,
    answers: Mutex<Vec<String>>,
    embed_overrides: Mutex<HashMap<String, Vec<f32>>>,
}

impl MockLlm {
    fn push_spans(&self, s: Vec<SpanRange>) {
        self.spans.lock().unwrap().push(s);
    }
    fn push_structure(&self, s: CaseStructure) {
        self.structures.lock().unwrap().push(s);
    }
    fn push_resolution(&self, r: ResolutionCheck) {
        self.resolutions.lock().unwrap().push(r);
    }
    fn set_gate(&self, g: GateDecision) {
        *self.gate.lock().unwrap() = Some(g);
    }
    fn push_answer(&self, a: &str) {
        self.answers.lock().unwrap().push(a.to_string());
    }
    fn override_embedding(&self, text: &str, v: Vec<f32>) {
        self.embed_overrides
            .lock()
            .unwrap()
            .insert(text.to_string(), v);
    }
}

#[async_trait]
impl LlmGateway for MockLlm {
    async fn image_to_text(&self, _image: &ImageData, _ctx: &str) -> opora_llm::Result<ImageFacts> {
        Ok(ImageFacts {
            observations: vec!["screenshot".to_string()],
            extracted_text: String::new(),
        })
    }

    async fn gate_classify(
        &self,
        _message: &str,
        _recent: &str,
        _images: &[ImageData],
    ) -> opora_llm::Result<GateDecision> {
        Ok(self
            .gate
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(GateDecision {
                consider: true,
                tag: GateTag::NewQuestion,
            })
            .normalized())
    }

    async fn extract_case_spans(
        &self,
        _numbered: &str,
        block_count: usize,
    ) -> opora_llm::Result<Vec<SpanRange>> {
        let mut q = self.spans.lock().unwrap();
        let spans = if q.is_empty() { Vec::new() } else { q.remove(0) };
        validate_spans(&spans, block_count).map_err(LlmError::InvalidSpans)?;
        Ok(spans)
    }

    async fn structure_case(&self, _text: &str) -> opora_llm::Result<CaseStructure> {
        let mut q = self.structures.lock().unwrap();
        if q.is_empty() {
            Ok(CaseStructure {
                keep: false,
                status: ProposedStatus::Open,
                problem_title: String::new(),
                problem_summary: String::new(),
                solution_summary: String::new(),
                tags: vec![],
            })
        } else {
            Ok(q.remove(0).normalized())
        }
    }

    async fn check_resolved(
        &self,
        _title: &str,
        _problem: &str,
        _buffer: &str,
    ) -> opora_llm::Result<ResolutionCheck> {
        let mut q = self.resolutions.lock().unwrap();
        if q.is_empty() {
            Ok(ResolutionCheck {
                resolved: false,
                solution_summary: String::new(),
            })
        } else {
            Ok(q.remove(0).normalized())
        }
    }

    async fn embed(&self, text: &str) -> opora_llm::Result<Vec<f32>> {
        if let Some(v) = self.embed_overrides.lock().unwrap().get(text) {
            return Ok(v.clone());
        }
        Ok(hash_embedding(text))
    }

    async fn synthesize_answer(
        &self,
        _question: &str,
        _context: &str,
        _lang: opora_core::types::Lang,
    ) -> opora_llm::Result<String> {
        let mut q = self.answers.lock().unwrap();
        if q.is_empty() {
            Ok("[[TAG_ADMIN]]".to_string())
        } else {
            Ok(q.remove(0))
        }
    }
}

#[derive(Default)]
struct MockTransport {
    /// Successful group sends only.
    group_sends: Mutex<Vec<(String, String, Option<String>, Vec<String>)>>,
    direct_sends: Mutex<Vec<(String, String)>>,
    groups: Mutex<Vec<(GroupId, String)>>,
    /// Scripted outcomes popped front-first; empty means Ok(true).
    /// Err(msg) becomes a TransportError::Unavailable.
    group_send_script: Mutex<Vec<Result<bool, String>>>,
}

impl MockTransport {
    fn script_group_send(&self, outcome: Result<bool, String>) {
        self.group_send_script.lock().unwrap().push(outcome);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_group_text(
        &self,
        group_id: &GroupId,
        text: &str,
        quote: Option<&str>,
        mentions: &[String],
    ) -> Result<bool, TransportError> {
        let outcome = {
            let mut script = self.group_send_script.lock().unwrap();
            if script.is_empty() {
                Ok(true)
            } else {
                script.remove(0)
            }
        };
        match outcome {
            Ok(true) => {
                self.group_sends.lock().unwrap().push((
                    group_id.as_str().to_string(),
                    text.to_string(),
                    quote.map(String::from),
                    mentions.to_vec(),
                ));
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(msg) => Err(TransportError::Unavailable(msg)),
        }
    }

    async fn send_direct_text(
        &self,
        admin_id: &str,
        text: &str,
        _attachment: Option<&[u8]>,
    ) -> Result<bool, TransportError> {
        self.direct_sends
            .lock()
            .unwrap()
            .push((admin_id.to_string(), text.to_string()));
        Ok(true)
    }

    async fn list_groups(&self) -> Result<Vec<(GroupId, String)>, TransportError> {
        Ok(self.groups.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct MockHistory {
    delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl HistoryNotifier for MockHistory {
    async fn deliver_link_token(
        &self,
        token: &str,
        _group: &GroupId,
        _hint: &str,
    ) -> Result<(), TransportError> {
        self.delivered.lock().unwrap().push(token.to_string());
        Ok(())
    }
}

struct Harness {
    deps: Arc<Deps>,
    llm: Arc<MockLlm>,
    transport: Arc<MockTransport>,
}

fn harness() -> Harness {
    let llm = Arc::new(MockLlm::default());
    let transport = Arc::new(MockTransport::default());
    let history = Arc::new(MockHistory::default());

    let config = OporaConfig {
        server: ServerConfig {
            public_base_url: "https://opora.test".to_string(),
            ..ServerConfig::default()
        },
        database: DatabaseConfig::default(),
        llm: LlmConfig {
            api_key: "test".to_string(),
            base_url: "http://llm.test".to_string(),
            chat_model: "test-model".to_string(),
            embed_model: "test-embed".to_string(),
            embed_dim: DIM,
            timeout_ms: 1000,
            calls_per_second: 100.0,
            burst: 100,
        },
        transport: TransportConfig {
            base_url: "http://transport.test".to_string(),
            api_token: None,
            timeout_ms: 1000,
            bot_sender_hash: opora_core::hash::sender_hash("bot@opora"),
            bot_mentions: vec!["@opora".to_string()],
        },
        buffer: BufferConfig::default(),
        cases: CasesConfig {
            dedup_threshold: 0.9,
            ..CasesConfig::default()
        },
        answer: AnswerConfig::default(),
        queue: QueueConfig::default(),
        images: ImagesConfig::default(),
        history: HistoryConfig::default(),
        admin: AdminConfig::default(),
    };

    let deps = Arc::new(Deps {
        config,
        store: Arc::new(Store::open_in_memory().unwrap()),
        index: Arc::new(CaseIndex::open_in_memory(DIM).unwrap()),
        llm: llm.clone(),
        transport: transport.clone(),
        history: history.clone(),
        queue: Arc::new(JobQueue::open_in_memory(5, 60_000).unwrap()),
        locks: GroupLocks::new(),
    });

    Harness {
        deps,
        llm,
        transport,
    }
}

fn inbound(group: &str, id: &str, ts: i64, sender: &str, text: &str) -> InboundMessage {
    InboundMessage {
        group_id: GroupId::from(group),
        message_id: id.to_string(),
        ts,
        sender: sender.to_string(),
        sender_name: Some("Petro".to_string()),
        text: text.to_string(),
        image_paths: vec![],
        reply_to_id: None,
        is_direct: false,
    }
}

async fn ingest_and_update(h: &Harness, group: &str, id: &str, ts: i64, text: &str) {
    ingest::process_inbound_message(&h.deps, inbound(group, id, ts, "user@test", text))
        .await
        .unwrap();
    extractor::run_buffer_update(
        &h.deps,
        &GroupId::from(group),
        id,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
}

fn solved_structure(title: &str, solution: &str) -> CaseStructure {
    CaseStructure {
        keep: true,
        status: ProposedStatus::Solved,
        problem_title: title.to_string(),
        problem_summary: format!("{title} (details)"),
        solution_summary: solution.to_string(),
        tags: vec!["support".to_string()],
    }
}

fn open_structure(title: &str) -> CaseStructure {
    CaseStructure {
        keep: true,
        status: ProposedStatus::Open,
        problem_title: title.to_string(),
        problem_summary: format!("{title} (details)"),
        solution_summary: String::new(),
        tags: vec![],
    }
}

fn group_cases(h: &Harness, group: &str, status: &str) -> Vec<Case> {
    let g = GroupId::from(group);
    match status {
        "open" => h.deps.store.get_open_cases_for_group(&g).unwrap(),
        "solved" => h.deps.store.get_recent_solved_cases(&g, 0).unwrap(),
        other => panic!("unexpected status {other}"),
    }
}

// --- scenario 1: solo solved case via extraction ---------------------------

#[tokio::test]
async fn solo_solved_case_extracted_and_indexed() {
    let h = harness();
    let t0 = opora_core::now_ms();

    h.llm.push_spans(vec![]);
    h.llm.push_spans(vec![]);
    h.llm.push_spans(vec![SpanRange {
        start_idx: 0,
        end_idx: 2,
    }]);
    h.llm
        .push_structure(solved_structure("How to reset X", "Set flag Y to true"));

    ingest_and_update(&h, "g1", "m1", t0 - 3000, "How do I reset X?").await;
    ingest_and_update(&h, "g1", "m2", t0 - 2000, "Set flag Y to true.").await;
    ingest_and_update(&h, "g1", "m3", t0 - 1000, "Worked, thanks.").await;

    let solved = group_cases(&h, "g1", "solved");
    assert_eq!(solved.len(), 1);
    let case = &solved[0];
    assert_eq!(case.status, CaseStatus::Solved);
    assert_eq!(case.evidence_ids, vec!["m1", "m2", "m3"]);
    assert!(case.in_index);
    assert_eq!(
        h.deps.index.list_ids(Some(&GroupId::from("g1"))).unwrap(),
        vec![case.case_id.clone()]
    );

    let buffer = h.deps.store.get_buffer(&GroupId::from("g1")).unwrap();
    assert!(!buffer.contains("msg_id=m1"));
    assert!(!buffer.contains("msg_id=m2"));
    assert!(!buffer.contains("msg_id=m3"));
}

// --- scenario 2: open case, then dynamic resolution ------------------------

#[tokio::test]
async fn open_case_resolves_dynamically() {
    let h = harness();
    let t0 = opora_core::now_ms();

    h.llm.push_spans(vec![SpanRange {
        start_idx: 0,
        end_idx: 0,
    }]);
    h.llm.push_structure(open_structure("Cannot arm drone, err 0x8000"));

    ingest_and_update(&h, "g1", "m1", t0 - 2000, "Cannot arm drone, err 0x8000").await;

    let open = group_cases(&h, "g1", "open");
    assert_eq!(open.len(), 1);
    assert!(!open[0].in_index);
    // Open span stays in the buffer.
    assert!(h
        .deps
        .store
        .get_buffer(&GroupId::from("g1"))
        .unwrap()
        .contains("msg_id=m1"));

    // Next message carries the fix; phase 2 resolves the open case.
    h.llm.push_spans(vec![]);
    h.llm.push_resolution(ResolutionCheck {
        resolved: true,
        solution_summary: "Disable GPS and compass".to_string(),
    });

    ingest_and_update(&h, "g1", "m2", t0 - 1000, "Disable GPS and compass; now arms.").await;

    let open = group_cases(&h, "g1", "open");
    assert!(open.is_empty());
    let solved = group_cases(&h, "g1", "solved");
    assert_eq!(solved.len(), 1);
    assert_eq!(solved[0].solution_summary, "Disable GPS and compass");
    assert!(solved[0].in_index);
    assert_eq!(h.deps.index.count().unwrap(), 1);
}

// --- scenario 3: positive reaction solves ----------------------------------

#[tokio::test]
async fn positive_reaction_confirms_case() {
    let h = harness();
    let t0 = opora_core::now_ms();

    h.llm.push_spans(vec![SpanRange {
        start_idx: 0,
        end_idx: 0,
    }]);
    h.llm.push_structure(open_structure("Radio drops on channel 7"));
    ingest_and_update(&h, "g1", "m1", t0 - 1000, "Radio drops on channel 7").await;

    reactions::handle_reaction(
        &h.deps,
        InboundReaction {
            group_id: GroupId::from("g1"),
            target_ts: t0 - 1000,
            target_author: "user@test".to_string(),
            sender: "other@test".to_string(),
            emoji: "👍".to_string(),
            is_remove: false,
        },
    )
    .await
    .unwrap();

    let solved = group_cases(&h, "g1", "solved");
    assert_eq!(solved.len(), 1);
    assert_eq!(solved[0].closed_emoji.as_deref(), Some("👍"));
    // No solution text yet: not promoted to the index.
    assert!(!solved[0].in_index);

    // Removing the reaction never un-solves.
    reactions::handle_reaction(
        &h.deps,
        InboundReaction {
            group_id: GroupId::from("g1"),
            target_ts: t0 - 1000,
            target_author: "user@test".to_string(),
            sender: "other@test".to_string(),
            emoji: "👍".to_string(),
            is_remove: true,
        },
    )
    .await
    .unwrap();
    assert_eq!(group_cases(&h, "g1", "solved").len(), 1);
}

// --- scenario 4: gate silences noise ---------------------------------------

#[tokio::test]
async fn gate_silences_noise() {
    let h = harness();
    let g = GroupId::from("g1");

    // Linked admin so the engine gets past the language step.
    h.deps.store.link_admin_group("admin1", &g).unwrap();

    ingest::process_inbound_message(&h.deps, inbound("g1", "m1", 1000, "user@test", "👍"))
        .await
        .unwrap();

    h.llm.set_gate(GateDecision {
        consider: false,
        tag: GateTag::Noise,
    });
    answer::run_maybe_respond(&h.deps, &g, "m1").await.unwrap();

    assert!(h.transport.group_sends.lock().unwrap().is_empty());
}

// --- scenario 5: dedup merges a re-report ----------------------------------

#[tokio::test]
async fn dedup_merges_similar_case() {
    let h = harness();
    let g = GroupId::from("g1");
    let t0 = opora_core::now_ms();

    // Existing solved case with a known dedup embedding.
    let mut e1 = vec![0.0f32; DIM];
    e1[0] = 1.0;
    ingest::process_inbound_message(
        &h.deps,
        inbound("g1", "m0", t0 - 5000, "user@test", "old report"),
    )
    .await
    .unwrap();
    let existing = Case {
        case_id: CaseId::from("c1"),
        group_id: g.clone(),
        status: CaseStatus::Solved,
        problem_title: "VTX overheats".to_string(),
        problem_summary: "VTX shuts down after minutes".to_string(),
        solution_summary: "Add a heatsink".to_string(),
        tags: vec![],
        evidence_ids: vec!["m0".to_string()],
        dedup_embedding: Some(e1.clone()),
        in_index: false,
        closed_emoji: None,
        created_at: 500,
        updated_at: 500,
    };
    h.deps.store.insert_case(&existing).unwrap();

    // New span about the same problem, differently worded; its dedup text
    // embeds right onto E1.
    let structure = solved_structure("Video transmitter too hot", "Add a heatsink");
    let dedup_text = format!(
        "{}\n{}",
        structure.problem_title, structure.problem_summary
    );
    h.llm.override_embedding(&dedup_text, e1);

    // m1's update sees no span yet; m2's update carries the span over both.
    h.llm.push_spans(vec![]);
    h.llm.push_spans(vec![SpanRange {
        start_idx: 0,
        end_idx: 1,
    }]);
    h.llm.push_structure(structure);

    ingest::process_inbound_message(
        &h.deps,
        inbound("g1", "m1", t0 - 2000, "user@test", "video tx is burning hot"),
    )
    .await
    .unwrap();
    ingest::process_inbound_message(
        &h.deps,
        inbound("g1", "m2", t0 - 1000, "user2@test", "same here"),
    )
    .await
    .unwrap();
    extractor::run_buffer_update(&h.deps, &g, "m1", &CancellationToken::new())
        .await
        .unwrap();
    extractor::run_buffer_update(&h.deps, &g, "m2", &CancellationToken::new())
        .await
        .unwrap();

    // No new case; evidence grew on c1.
    let solved = group_cases(&h, "g1", "solved");
    assert_eq!(solved.len(), 1);
    assert_eq!(solved[0].case_id, CaseId::from("c1"));
    assert_eq!(solved[0].evidence_ids, vec!["m0", "m1", "m2"]);
}

// --- scenario 6: span validation rejects overlap ---------------------------

#[tokio::test]
async fn overlapping_spans_reject_whole_extraction() {
    let h = harness();
    let g = GroupId::from("g1");
    let t0 = opora_core::now_ms();

    for i in 0..6i64 {
        ingest::process_inbound_message(
            &h.deps,
            inbound("g1", &format!("m{i}"), t0 - 6000 + i * 1000, "user@test", "text"),
        )
        .await
        .unwrap();
    }
    for i in 0..5 {
        h.llm.push_spans(vec![]);
        extractor::run_buffer_update(&h.deps, &g, &format!("m{i}"), &CancellationToken::new())
            .await
            .unwrap();
    }

    let before = h.deps.store.get_buffer(&g).unwrap();
    h.llm.push_spans(vec![
        SpanRange { start_idx: 0, end_idx: 3 },
        SpanRange { start_idx: 2, end_idx: 5 },
    ]);
    extractor::run_buffer_update(&h.deps, &g, "m5", &CancellationToken::new())
        .await
        .unwrap();

    // Extraction rejected wholesale: m5 appended, nothing removed.
    let after = h.deps.store.get_buffer(&g).unwrap();
    assert!(after.starts_with(before.trim_end_matches('\n')));
    assert!(after.contains("msg_id=m5"));
    assert!(group_cases(&h, "g1", "open").is_empty());
    assert!(group_cases(&h, "g1", "solved").is_empty());
}

// --- buffer-update idempotence under redelivery ----------------------------

#[tokio::test]
async fn redelivered_buffer_update_is_a_no_op() {
    let h = harness();
    let g = GroupId::from("g1");
    let t0 = opora_core::now_ms();

    h.llm.push_spans(vec![]);
    h.llm.push_spans(vec![]);
    h.llm.push_spans(vec![SpanRange { start_idx: 0, end_idx: 2 }]);
    h.llm
        .push_structure(solved_structure("Reset X", "Flag Y"));

    ingest_and_update(&h, "g1", "m1", t0 - 3000, "How do I reset X?").await;
    ingest_and_update(&h, "g1", "m2", t0 - 2000, "Set flag Y.").await;
    ingest_and_update(&h, "g1", "m3", t0 - 1000, "Worked.").await;

    let buffer_once = h.deps.store.get_buffer(&g).unwrap();
    let cases_once = group_cases(&h, "g1", "solved");

    // Redeliver m3's job; the mock returns no spans and the message is
    // already evidence, so nothing changes.
    extractor::run_buffer_update(&h.deps, &g, "m3", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.deps.store.get_buffer(&g).unwrap(), buffer_once);
    let cases_twice = group_cases(&h, "g1", "solved");
    assert_eq!(cases_once.len(), cases_twice.len());
    assert_eq!(cases_once[0].evidence_ids, cases_twice[0].evidence_ids);
}

// --- answer engine ---------------------------------------------------------

async fn seed_admin(h: &Harness, group: &GroupId) {
    h.deps.store.link_admin_group("admin1", group).unwrap();
    admin::handle_direct_message(&h.deps, "admin1", "Hello").await.unwrap();
}

#[tokio::test]
async fn answer_uses_solved_context_and_sends_quoted_reply() {
    let h = harness();
    let g = GroupId::from("g1");
    seed_admin(&h, &g).await;

    // A solved case in the store, recent enough for the B3 window.
    ingest::process_inbound_message(&h.deps, inbound("g1", "m0", 500, "user@test", "old"))
        .await
        .unwrap();
    let case = Case {
        case_id: CaseId::from("c1"),
        group_id: g.clone(),
        status: CaseStatus::Solved,
        problem_title: "Reset X".to_string(),
        problem_summary: "X stuck".to_string(),
        solution_summary: "Set flag Y".to_string(),
        tags: vec![],
        evidence_ids: vec!["m0".to_string()],
        dedup_embedding: None,
        in_index: false,
        closed_emoji: None,
        created_at: opora_core::now_ms(),
        updated_at: opora_core::now_ms(),
    };
    h.deps.store.insert_case(&case).unwrap();

    ingest::process_inbound_message(
        &h.deps,
        inbound("g1", "m1", opora_core::now_ms(), "user@test", "how do I reset X?"),
    )
    .await
    .unwrap();

    h.llm
        .push_answer("Set flag Y to true. https://opora.test/cases/c1");
    answer::run_maybe_respond(&h.deps, &g, "m1").await.unwrap();

    let sends = h.transport.group_sends.lock().unwrap();
    assert_eq!(sends.len(), 1);
    let (group, text, quote, mentions) = &sends[0];
    assert_eq!(group, "g1");
    assert!(text.contains("https://opora.test/cases/c1"));
    assert_eq!(quote.as_deref(), Some("m1"));
    assert!(mentions.is_empty());
}

#[tokio::test]
async fn answer_without_context_tags_admins() {
    let h = harness();
    let g = GroupId::from("g1");
    seed_admin(&h, &g).await;

    ingest::process_inbound_message(
        &h.deps,
        inbound("g1", "m1", 1000, "user@test", "my quad keeps rebooting"),
    )
    .await
    .unwrap();

    answer::run_maybe_respond(&h.deps, &g, "m1").await.unwrap();

    let sends = h.transport.group_sends.lock().unwrap();
    assert_eq!(sends.len(), 1);
    let (_, text, _, mentions) = &sends[0];
    assert!(text.contains("@admin1"));
    assert!(!text.contains("[[TAG_ADMIN]]"));
    assert_eq!(mentions, &vec!["admin1".to_string()]);
}

#[tokio::test]
async fn open_context_reply_always_tags_admins() {
    let h = harness();
    let g = GroupId::from("g1");
    seed_admin(&h, &g).await;

    ingest::process_inbound_message(&h.deps, inbound("g1", "m0", 500, "user@test", "old"))
        .await
        .unwrap();
    let case = Case {
        case_id: CaseId::from("c1"),
        group_id: g.clone(),
        status: CaseStatus::Open,
        problem_title: "Rebooting quad".to_string(),
        problem_summary: "Reboots mid-flight".to_string(),
        solution_summary: String::new(),
        tags: vec![],
        evidence_ids: vec!["m0".to_string()],
        dedup_embedding: None,
        in_index: false,
        closed_emoji: None,
        created_at: opora_core::now_ms(),
        updated_at: opora_core::now_ms(),
    };
    h.deps.store.insert_case(&case).unwrap();

    ingest::process_inbound_message(
        &h.deps,
        inbound("g1", "m1", 1000, "user@test", "quad reboots, any news?"),
    )
    .await
    .unwrap();

    // Synthesizer "forgets" the sentinel; the engine appends it anyway.
    h.llm
        .push_answer("Known issue, tracked at https://opora.test/cases/c1.");
    answer::run_maybe_respond(&h.deps, &g, "m1").await.unwrap();

    let sends = h.transport.group_sends.lock().unwrap();
    assert_eq!(sends.len(), 1);
    assert!(sends[0].1.contains("@admin1"));
}

#[tokio::test]
async fn reply_is_idempotent_per_message() {
    let h = harness();
    let g = GroupId::from("g1");
    seed_admin(&h, &g).await;

    ingest::process_inbound_message(
        &h.deps,
        inbound("g1", "m1", 1000, "user@test", "help with X"),
    )
    .await
    .unwrap();

    answer::run_maybe_respond(&h.deps, &g, "m1").await.unwrap();
    answer::run_maybe_respond(&h.deps, &g, "m1").await.unwrap();

    assert_eq!(h.transport.group_sends.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn transport_error_releases_claim_so_retry_can_send() {
    let h = harness();
    let g = GroupId::from("g1");
    seed_admin(&h, &g).await;

    ingest::process_inbound_message(
        &h.deps,
        inbound("g1", "m1", 1000, "user@test", "help with X"),
    )
    .await
    .unwrap();

    // First delivery hits a transient transport failure.
    h.transport
        .script_group_send(Err("connect timeout".to_string()));
    let err = answer::run_maybe_respond(&h.deps, &g, "m1").await.unwrap_err();
    assert!(err.is_transient());
    assert!(h.transport.group_sends.lock().unwrap().is_empty());
    // The admin is untouched: an I/O failure says nothing about them.
    assert_eq!(h.deps.store.admins_for_group(&g).unwrap(), vec!["admin1"]);

    // The worker's retry claims again and sends for real.
    answer::run_maybe_respond(&h.deps, &g, "m1").await.unwrap();
    assert_eq!(h.transport.group_sends.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn rejected_send_removes_tagged_admins() {
    let h = harness();
    let g = GroupId::from("g1");
    seed_admin(&h, &g).await;

    ingest::process_inbound_message(
        &h.deps,
        inbound("g1", "m1", 1000, "user@test", "help with X"),
    )
    .await
    .unwrap();

    // No retrieval context, so the reply tags admin1; the adapter then
    // reports the recipient unreachable.
    h.transport.script_group_send(Ok(false));
    let err = answer::run_maybe_respond(&h.deps, &g, "m1").await.unwrap_err();
    assert!(err.is_transient());

    // Unreachable admin is torn down: session and group link gone.
    assert!(h.deps.store.get_admin_session("admin1").unwrap().is_none());
    assert!(h.deps.store.admins_for_group(&g).unwrap().is_empty());
    // The claim was released before the error surfaced.
    assert_eq!(
        h.deps.store.claim_reply(&g, "m1").unwrap(),
        opora_store::InsertOutcome::Inserted
    );
}

#[tokio::test]
async fn unadministered_group_stays_silent() {
    let h = harness();
    let g = GroupId::from("g1");

    ingest::process_inbound_message(
        &h.deps,
        inbound("g1", "m1", 1000, "user@test", "anyone here?"),
    )
    .await
    .unwrap();
    answer::run_maybe_respond(&h.deps, &g, "m1").await.unwrap();

    assert!(h.transport.group_sends.lock().unwrap().is_empty());
}

// --- admin onboarding ------------------------------------------------------

#[tokio::test]
async fn admin_flow_mints_token_and_links_on_bootstrap() {
    let h = harness();
    let g = GroupId::from("g-support");
    h.transport
        .groups
        .lock()
        .unwrap()
        .push((g.clone(), "Drone Support".to_string()));

    // First DM in Ukrainian: welcome + language detection.
    admin::handle_direct_message(&h.deps, "admin1", "Привіт!").await.unwrap();
    let session = h.deps.store.get_admin_session("admin1").unwrap().unwrap();
    assert_eq!(session.lang, opora_core::types::Lang::Uk);

    // Group name: token minted, HISTORY_LINK queued, state advances.
    admin::handle_direct_message(&h.deps, "admin1", "Drone Support").await.unwrap();
    let session = h.deps.store.get_admin_session("admin1").unwrap().unwrap();
    assert_eq!(session.state, opora_core::types::AdminState::AwaitingQrScan);
    let token = session.pending_token.clone().unwrap();
    assert_eq!(h.deps.queue.depth().unwrap(), 1);

    // Collaborator posts extracted cases; token is consumed, link created.
    ingest::process_inbound_message(
        &h.deps,
        inbound("g-support", "m10", 1000, "user@test", "how to bind RC?"),
    )
    .await
    .unwrap();
    h.llm.push_structure(solved_structure("Bind RC", "Hold bind button"));
    let imported = history::ingest_history_cases(
        &h.deps,
        &token,
        vec![history::HistoryCaseEntry {
            case_block: "aaa ts=1000 msg_id=m10 reactions=0\nhow to bind RC?".to_string(),
            reaction_emoji: Some("👍".to_string()),
        }],
    )
    .await
    .unwrap();
    assert_eq!(imported, 1);

    assert_eq!(h.deps.store.admins_for_group(&g).unwrap(), vec!["admin1"]);
    // Single use: the same token is now rejected.
    let err = history::ingest_history_cases(&h.deps, &token, vec![]).await;
    assert!(err.is_err());

    let solved = group_cases(&h, "g-support", "solved");
    assert_eq!(solved.len(), 1);
    assert_eq!(solved[0].closed_emoji.as_deref(), Some("👍"));
    assert_eq!(solved[0].evidence_ids, vec!["m10"]);
    assert!(solved[0].in_index);
}

// --- reconciler ------------------------------------------------------------

#[tokio::test]
async fn reconciler_heals_index_in_both_directions() {
    let h = harness();
    let g = GroupId::from("g1");

    // A solved case flagged in_index but missing from the index...
    ingest::process_inbound_message(&h.deps, inbound("g1", "m1", 1000, "user@test", "q"))
        .await
        .unwrap();
    let case = Case {
        case_id: CaseId::from("c1"),
        group_id: g.clone(),
        status: CaseStatus::Solved,
        problem_title: "Missing from index".to_string(),
        problem_summary: "problem".to_string(),
        solution_summary: "solution".to_string(),
        tags: vec![],
        evidence_ids: vec!["m1".to_string()],
        dedup_embedding: None,
        in_index: true,
        closed_emoji: None,
        created_at: 1000,
        updated_at: 1000,
    };
    h.deps.store.insert_case(&case).unwrap();

    // ...and an index entry whose case no longer exists in the store.
    h.deps
        .index
        .upsert_case(
            &CaseId::from("ghost"),
            "ghost doc",
            &hash_embedding("ghost doc"),
            &opora_index::IndexMetadata {
                group_id: g.clone(),
                status: "solved".to_string(),
                evidence_ids: vec![],
                evidence_image_paths: vec![],
            },
        )
        .unwrap();

    let reconciler = opora_agent::reconciler::Reconciler::new(Arc::clone(&h.deps));
    reconciler.tick().await.unwrap();

    let ids = h.deps.index.list_ids(None).unwrap();
    assert_eq!(ids, vec![CaseId::from("c1")]);
    // Equality both ways: every in_index case is present, nothing else is.
    let marked = h.deps.store.cases_marked_in_index().unwrap();
    assert_eq!(marked.len(), 1);
    assert_eq!(marked[0].case_id, CaseId::from("c1"));
}

#[tokio::test]
async fn wipe_removes_admin_and_orphaned_group_data() {
    let h = harness();
    let g = GroupId::from("g1");
    seed_admin(&h, &g).await;
    ingest::process_inbound_message(&h.deps, inbound("g1", "m1", 1000, "user@test", "hi"))
        .await
        .unwrap();

    admin::handle_direct_message(&h.deps, "admin1", "/wipe").await.unwrap();

    assert!(h.deps.store.get_admin_session("admin1").unwrap().is_none());
    assert!(h.deps.store.admins_for_group(&g).unwrap().is_empty());
    assert!(h.deps.store.get_message(&g, "m1").unwrap().is_none());
}
