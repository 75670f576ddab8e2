//! Per-group rolling message buffer: block formatting, deterministic
//! parsing, trim policy, the numbered rendering fed to span extraction,
//! and validated span removal.
//!
//! Everything here is pure text-in/text-out; persistence and locking are
//! the pipeline's concern. Parsing and rebuilding the same text is a fixed
//! point, which is what makes span removal safe to re-run.

use thiserror::Error;
use tracing::warn;

use opora_core::types::RawMessage;
use opora_llm::types::{validate_spans, SpanRange};

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("Span validation failed: {0}")]
    InvalidSpans(String),
}

pub type Result<T> = std::result::Result<T, BufferError>;

/// One parsed message block.
///
/// `index` is the block's position in the parse; spans reference these
/// indices. `start_line`/`end_line` are 1-based line numbers in the source
/// buffer text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: usize,
    pub sender_hash: String,
    pub from_bot: bool,
    pub ts: i64,
    pub message_id: String,
    pub reply_to: Option<String>,
    pub reactions: u32,
    pub body: String,
    pub raw_text: String,
    pub start_line: usize,
    pub end_line: usize,
}

/// Format one message as a buffer block (header line + body).
///
/// ```text
/// <sender_hash>[BOT?] ts=<ms> msg_id=<id> [reply_to=<id>] reactions=<n>
/// <content_text>
/// ```
pub fn format_block(m: &RawMessage) -> String {
    let bot = if m.from_bot { "[BOT]" } else { "" };
    let reply = m
        .reply_to_id
        .as_deref()
        .map(|r| format!(" reply_to={}", r))
        .unwrap_or_default();
    let header = format!(
        "{}{} ts={} msg_id={}{} reactions={}",
        m.sender_hash, bot, m.ts, m.message_id, reply, m.reaction_count
    );
    if m.content_text.is_empty() {
        header
    } else {
        format!("{}\n{}", header, m.content_text)
    }
}

/// Append a freshly formatted block to the buffer text.
pub fn append(buffer_text: &str, m: &RawMessage) -> String {
    let block = format_block(m);
    if buffer_text.trim().is_empty() {
        format!("{}\n", block)
    } else {
        format!("{}\n{}\n", buffer_text.trim_end_matches('\n'), block)
    }
}

/// Parse buffer text into blocks. Deterministic: a line is a block header
/// iff it carries the `ts=`, `msg_id=` and trailing `reactions=` fields;
/// every other line belongs to the current block's body. Trailing blank
/// lines of a body are normalized away, so parse ∘ rebuild is a fixed point.
pub fn parse_to_blocks(buffer_text: &str) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut current: Option<(HeaderFields, Vec<String>, usize)> = None;

    for (line_no, line) in buffer_text.lines().enumerate() {
        let line_no = line_no + 1;
        if let Some(header) = parse_header(line) {
            if let Some((h, body, start)) = current.take() {
                blocks.push(finish_block(blocks.len(), h, body, start, line_no - 1));
            }
            current = Some((header, Vec::new(), line_no));
        } else if let Some((_, ref mut body, _)) = current {
            body.push(line.to_string());
        }
        // Lines before the first header are dropped; an intact buffer
        // always starts with a header.
    }
    if let Some((h, body, start)) = current.take() {
        let end = buffer_text.lines().count();
        blocks.push(finish_block(blocks.len(), h, body, start, end));
    }
    blocks
}

/// Rebuild buffer text from blocks, one blank line between blocks.
pub fn rebuild(blocks: &[Block]) -> String {
    if blocks.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    for (i, b) in blocks.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&b.raw_text);
        out.push('\n');
    }
    out
}

/// Trim policy: age-based eviction first, then count-based (oldest first).
///
/// Blocks are normalised to timestamp order first, so a message whose job
/// was processed late still lands in its chronological position.
pub fn trim_blocks(blocks: Vec<Block>, now_ms: i64, max_age_hours: i64, max_messages: usize) -> Vec<Block> {
    let cutoff = now_ms - max_age_hours * 60 * 60 * 1000;
    let mut kept: Vec<Block> = blocks.into_iter().filter(|b| b.ts >= cutoff).collect();
    kept.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.message_id.cmp(&b.message_id)));
    if kept.len() > max_messages {
        let excess = kept.len() - max_messages;
        kept.drain(..excess);
    }
    for (i, b) in kept.iter_mut().enumerate() {
        b.index = i;
    }
    kept
}

/// Render the extraction input: every non-bot block, delimited by
/// `### MSG idx=<i> lines=<a>-<b>` headers. Indices are the blocks'
/// positions in the full parse, so spans returned against this text
/// address the unfiltered block list directly.
pub fn format_numbered(blocks: &[Block]) -> String {
    let mut out = String::new();
    for b in blocks {
        if b.from_bot {
            continue;
        }
        out.push_str(&format!(
            "### MSG idx={} lines={}-{}\n{}\n",
            b.index, b.start_line, b.end_line, b.raw_text
        ));
    }
    out
}

/// Compose the text of one accepted span from the unfiltered blocks.
pub fn span_text(blocks: &[Block], span: SpanRange) -> String {
    blocks[span.start_idx..=span.end_idx]
        .iter()
        .map(|b| b.raw_text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Message ids covered by a span, in block order.
pub fn span_evidence_ids(blocks: &[Block], span: SpanRange) -> Vec<String> {
    blocks[span.start_idx..=span.end_idx]
        .iter()
        .map(|b| b.message_id.clone())
        .collect()
}

/// Remove exactly the blocks covered by the accepted spans and rebuild the
/// buffer. The whole set is re-validated against the block count; any
/// violation rejects the removal so a bad extraction can never corrupt
/// the buffer.
pub fn remove_spans(blocks: &[Block], accepted: &[SpanRange]) -> Result<String> {
    if let Err(reason) = validate_spans(accepted, blocks.len()) {
        warn!(%reason, "rejecting span removal");
        return Err(BufferError::InvalidSpans(reason));
    }
    let mut removed = vec![false; blocks.len()];
    for s in accepted {
        for slot in &mut removed[s.start_idx..=s.end_idx] {
            *slot = true;
        }
    }
    let kept: Vec<Block> = blocks
        .iter()
        .filter(|b| !removed[b.index])
        .cloned()
        .collect();
    Ok(rebuild(&kept))
}

struct HeaderFields {
    sender_hash: String,
    from_bot: bool,
    ts: i64,
    message_id: String,
    reply_to: Option<String>,
    reactions: u32,
}

/// A header line has the shape
/// `<hash>[BOT]? ts=<i64> msg_id=<id> [reply_to=<id>] reactions=<u32>`
/// with `reactions=` as the final token.
fn parse_header(line: &str) -> Option<HeaderFields> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 4 {
        return None;
    }
    let reactions = tokens.last()?.strip_prefix("reactions=")?.parse().ok()?;

    let first = tokens[0];
    let (sender_hash, from_bot) = match first.strip_suffix("[BOT]") {
        Some(h) => (h, true),
        None => (first, false),
    };
    if sender_hash.is_empty() || sender_hash.contains('=') {
        return None;
    }

    let mut ts: Option<i64> = None;
    let mut message_id: Option<&str> = None;
    let mut reply_to: Option<&str> = None;
    for tok in &tokens[1..tokens.len() - 1] {
        if let Some(v) = tok.strip_prefix("ts=") {
            ts = v.parse().ok();
        } else if let Some(v) = tok.strip_prefix("msg_id=") {
            message_id = Some(v);
        } else if let Some(v) = tok.strip_prefix("reply_to=") {
            reply_to = Some(v);
        } else {
            // Unknown token in header position: not a header line.
            return None;
        }
    }
    Some(HeaderFields {
        sender_hash: sender_hash.to_string(),
        from_bot,
        ts: ts?,
        message_id: message_id?.to_string(),
        reply_to: reply_to.map(String::from),
        reactions,
    })
}

fn finish_block(
    index: usize,
    h: HeaderFields,
    mut body_lines: Vec<String>,
    start_line: usize,
    end_line: usize,
) -> Block {
    while body_lines.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
        body_lines.pop();
    }
    let body = body_lines.join("\n");
    let header = format!(
        "{}{} ts={} msg_id={}{} reactions={}",
        h.sender_hash,
        if h.from_bot { "[BOT]" } else { "" },
        h.ts,
        h.message_id,
        h.reply_to
            .as_deref()
            .map(|r| format!(" reply_to={}", r))
            .unwrap_or_default(),
        h.reactions
    );
    let raw_text = if body.is_empty() {
        header
    } else {
        format!("{}\n{}", header, body)
    };
    let end_line = end_line.max(start_line);
    Block {
        index,
        sender_hash: h.sender_hash,
        from_bot: h.from_bot,
        ts: h.ts,
        message_id: h.message_id,
        reply_to: h.reply_to,
        reactions: h.reactions,
        body,
        raw_text,
        start_line,
        end_line,
    }
}
