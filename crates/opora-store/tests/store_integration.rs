use opora_core::types::{Case, CaseId, CaseStatus, GroupId, RawMessage};
use opora_store::cases::CaseDraft;
use opora_store::{InsertOutcome, Store};

fn msg(group: &str, id: &str, ts: i64, text: &str) -> RawMessage {
    RawMessage {
        group_id: GroupId::from(group),
        message_id: id.to_string(),
        ts,
        sender_hash: "aaaabbbbcccc".to_string(),
        sender_name: Some("Petro".to_string()),
        content_text: text.to_string(),
        image_paths: vec![],
        reply_to_id: None,
        reaction_count: 0,
        from_bot: false,
    }
}

fn case(group: &str, id: &str, status: CaseStatus, evidence: &[&str]) -> Case {
    Case {
        case_id: CaseId::from(id),
        group_id: GroupId::from(group),
        status,
        problem_title: format!("title {id}"),
        problem_summary: format!("problem {id}"),
        solution_summary: if status == CaseStatus::Solved {
            "a fix".to_string()
        } else {
            String::new()
        },
        tags: vec!["net".to_string()],
        evidence_ids: evidence.iter().map(|s| s.to_string()).collect(),
        dedup_embedding: Some(vec![1.0, 0.0, 0.0]),
        in_index: false,
        closed_emoji: None,
        created_at: 1_000,
        updated_at: 1_000,
    }
}

#[test]
fn raw_message_insert_is_idempotent() {
    let store = Store::open_in_memory().unwrap();
    let m = msg("g1", "m1", 1000, "hello");
    assert_eq!(store.insert_raw_message(&m).unwrap(), InsertOutcome::Inserted);
    assert_eq!(store.insert_raw_message(&m).unwrap(), InsertOutcome::Duplicate);

    let loaded = store.get_message(&GroupId::from("g1"), "m1").unwrap().unwrap();
    assert_eq!(loaded.content_text, "hello");
    assert_eq!(loaded.ts, 1000);
}

#[test]
fn buffer_round_trip_and_default_empty() {
    let store = Store::open_in_memory().unwrap();
    let g = GroupId::from("g1");
    assert_eq!(store.get_buffer(&g).unwrap(), "");
    store.set_buffer(&g, "line one\n").unwrap();
    assert_eq!(store.get_buffer(&g).unwrap(), "line one\n");
    store.set_buffer(&g, "").unwrap();
    assert_eq!(store.get_buffer(&g).unwrap(), "");
}

#[test]
fn case_insert_drops_unknown_evidence() {
    let store = Store::open_in_memory().unwrap();
    store.insert_raw_message(&msg("g1", "m1", 1000, "q")).unwrap();
    store
        .insert_case(&case("g1", "c1", CaseStatus::Open, &["m1", "ghost"]))
        .unwrap();
    let c = store.get_case(&CaseId::from("c1")).unwrap().unwrap();
    assert_eq!(c.evidence_ids, vec!["m1".to_string()]);
}

#[test]
fn merge_unions_evidence_and_keeps_longer_fields() {
    let store = Store::open_in_memory().unwrap();
    for (id, ts) in [("m1", 1000), ("m2", 2000), ("m3", 3000)] {
        store.insert_raw_message(&msg("g1", id, ts, "t")).unwrap();
    }
    store
        .insert_case(&case("g1", "c1", CaseStatus::Open, &["m1", "m2"]))
        .unwrap();

    let draft = CaseDraft {
        problem_title: "t".to_string(), // shorter, must not replace
        problem_summary: "a much longer description of the problem".to_string(),
        solution_summary: String::new(),
        tags: vec!["net".to_string(), "vpn".to_string()],
    };
    let merged = store
        .merge_case(
            &CaseId::from("c1"),
            &["m2".to_string(), "m3".to_string()],
            Some(&draft),
        )
        .unwrap();

    // m2 already present: union, order preserved, nothing lost
    assert_eq!(merged.evidence_ids, vec!["m1", "m2", "m3"]);
    assert_eq!(merged.problem_title, "title c1");
    assert_eq!(
        merged.problem_summary,
        "a much longer description of the problem"
    );
    assert_eq!(merged.tags, vec!["net", "vpn"]);
    assert_eq!(merged.created_at, 1_000);
}

#[test]
fn find_similar_prefers_more_evidence_then_earlier() {
    let store = Store::open_in_memory().unwrap();
    for (id, ts) in [("m1", 1000), ("m2", 2000), ("m3", 3000)] {
        store.insert_raw_message(&msg("g1", id, ts, "t")).unwrap();
    }
    // Identical embeddings: the tie must go to c2 (two evidence rows).
    let mut a = case("g1", "c1", CaseStatus::Open, &["m1"]);
    a.created_at = 500;
    let b = case("g1", "c2", CaseStatus::Open, &["m2", "m3"]);
    store.insert_case(&a).unwrap();
    store.insert_case(&b).unwrap();

    let hit = store
        .find_similar_case(&GroupId::from("g1"), &[1.0, 0.0, 0.0], 0.9, false, None)
        .unwrap();
    assert_eq!(hit, Some(CaseId::from("c2")));
}

#[test]
fn find_similar_respects_threshold_group_and_exclusion() {
    let store = Store::open_in_memory().unwrap();
    store.insert_raw_message(&msg("g1", "m1", 1000, "t")).unwrap();
    store
        .insert_case(&case("g1", "c1", CaseStatus::Open, &["m1"]))
        .unwrap();

    let g1 = GroupId::from("g1");
    // Orthogonal query: below threshold.
    assert_eq!(
        store
            .find_similar_case(&g1, &[0.0, 1.0, 0.0], 0.8, false, None)
            .unwrap(),
        None
    );
    // Other group: no hit.
    assert_eq!(
        store
            .find_similar_case(&GroupId::from("g2"), &[1.0, 0.0, 0.0], 0.8, false, None)
            .unwrap(),
        None
    );
    // Self-exclusion for the dynamic-resolution path.
    assert_eq!(
        store
            .find_similar_case(&g1, &[1.0, 0.0, 0.0], 0.8, false, Some(&CaseId::from("c1")))
            .unwrap(),
        None
    );
    // only_solved filters open candidates out.
    assert_eq!(
        store
            .find_similar_case(&g1, &[1.0, 0.0, 0.0], 0.8, true, None)
            .unwrap(),
        None
    );
}

#[test]
fn confirm_by_evidence_ts_solves_open_cases_only() {
    let store = Store::open_in_memory().unwrap();
    store.insert_raw_message(&msg("g1", "m1", 1000, "q")).unwrap();
    store.insert_raw_message(&msg("g1", "m2", 2000, "other")).unwrap();
    store
        .insert_case(&case("g1", "c1", CaseStatus::Open, &["m1"]))
        .unwrap();
    store
        .insert_case(&case("g1", "c2", CaseStatus::Open, &["m2"]))
        .unwrap();

    let solved = store
        .confirm_cases_by_evidence_ts(&GroupId::from("g1"), 1000, "👍")
        .unwrap();
    assert_eq!(solved, vec![CaseId::from("c1")]);

    let c1 = store.get_case(&CaseId::from("c1")).unwrap().unwrap();
    assert_eq!(c1.status, CaseStatus::Solved);
    assert_eq!(c1.closed_emoji.as_deref(), Some("👍"));
    // Solution untouched (blank) — derivation is the caller's business.
    assert!(c1.solution_summary.is_empty());

    let c2 = store.get_case(&CaseId::from("c2")).unwrap().unwrap();
    assert_eq!(c2.status, CaseStatus::Open);

    // Re-confirming is a no-op: c1 is no longer open.
    let again = store
        .confirm_cases_by_evidence_ts(&GroupId::from("g1"), 1000, "✅")
        .unwrap();
    assert!(again.is_empty());
}

#[test]
fn reaction_on_unrelated_message_confirms_nothing() {
    let store = Store::open_in_memory().unwrap();
    store.insert_raw_message(&msg("g1", "m1", 1000, "q")).unwrap();
    let solved = store
        .confirm_cases_by_evidence_ts(&GroupId::from("g1"), 1000, "👍")
        .unwrap();
    assert!(solved.is_empty());
}

#[test]
fn expire_archives_stale_open_cases() {
    let store = Store::open_in_memory().unwrap();
    store.insert_raw_message(&msg("g1", "m1", 1000, "q")).unwrap();
    store
        .insert_case(&case("g1", "c1", CaseStatus::Open, &["m1"]))
        .unwrap();

    // Cutoff after the row's updated_at: archived.
    let n = store.expire_old_open_cases(i64::MAX).unwrap();
    assert_eq!(n, 1);
    let c = store.get_case(&CaseId::from("c1")).unwrap().unwrap();
    assert_eq!(c.status, CaseStatus::Archived);
    assert!(!c.in_index);
}

#[test]
fn reply_ledger_claims_once() {
    let store = Store::open_in_memory().unwrap();
    let g = GroupId::from("g1");
    assert_eq!(store.claim_reply(&g, "m1").unwrap(), InsertOutcome::Inserted);
    assert_eq!(store.claim_reply(&g, "m1").unwrap(), InsertOutcome::Duplicate);
    store.release_reply(&g, "m1").unwrap();
    assert_eq!(store.claim_reply(&g, "m1").unwrap(), InsertOutcome::Inserted);
}

#[test]
fn history_token_single_use() {
    let store = Store::open_in_memory().unwrap();
    let tok = store
        .create_history_token("admin1", &GroupId::from("g1"), 60_000)
        .unwrap();
    let loaded = store.get_history_token(&tok.token).unwrap().unwrap();
    assert!(loaded.is_usable(opora_core::now_ms()));

    store.consume_history_token(&tok.token).unwrap();
    assert!(store.consume_history_token(&tok.token).is_err());

    let reaped = store.reap_history_tokens(opora_core::now_ms()).unwrap();
    assert_eq!(reaped, 1);
}

#[test]
fn wipe_admin_reports_orphaned_groups() {
    let store = Store::open_in_memory().unwrap();
    let g = GroupId::from("g1");
    store.link_admin_group("a1", &g).unwrap();
    store.link_admin_group("a2", &g).unwrap();

    // Another admin still linked: not orphaned.
    assert!(store.wipe_admin("a1").unwrap().is_empty());
    // Last admin gone: orphaned.
    assert_eq!(store.wipe_admin("a2").unwrap(), vec![g.clone()]);
}

#[test]
fn store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("opora.db");

    {
        let store = Store::open(&path, 1000).unwrap();
        store.insert_raw_message(&msg("g1", "m1", 1000, "persisted")).unwrap();
        store.set_buffer(&GroupId::from("g1"), "buffer text\n").unwrap();
    }

    let store = Store::open(&path, 1000).unwrap();
    let m = store.get_message(&GroupId::from("g1"), "m1").unwrap().unwrap();
    assert_eq!(m.content_text, "persisted");
    assert_eq!(store.get_buffer(&GroupId::from("g1")).unwrap(), "buffer text\n");
}

#[test]
fn group_wipe_cascades() {
    let store = Store::open_in_memory().unwrap();
    let g = GroupId::from("g1");
    store.insert_raw_message(&msg("g1", "m1", 1000, "q")).unwrap();
    store
        .insert_case(&case("g1", "c1", CaseStatus::Open, &["m1"]))
        .unwrap();
    store.set_buffer(&g, "text").unwrap();
    store.claim_reply(&g, "m1").unwrap();

    store.delete_group_data(&g).unwrap();
    assert!(store.get_message(&g, "m1").unwrap().is_none());
    assert!(store.get_case(&CaseId::from("c1")).unwrap().is_none());
    assert_eq!(store.get_buffer(&g).unwrap(), "");
    assert_eq!(store.claim_reply(&g, "m1").unwrap(), InsertOutcome::Inserted);
}
