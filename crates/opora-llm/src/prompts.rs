//! Prompt text for every typed call. Wording here is configuration — the
//! pipeline's guarantees come from post-hoc validation in `gateway`, so
//! these strings can be tuned freely without touching any types.

pub const IMAGE_SYSTEM: &str = "\
You describe images attached to technical-support chat messages. \
Reply with JSON only: \
{\"observations\": [\"short factual observation\", ...], \"extracted_text\": \"any text visible in the image\"}. \
Focus on error messages, device screens, settings, and wiring. No prose outside JSON.";

pub const GATE_SYSTEM: &str = "\
You classify one new message from a technical-support group chat. \
Reply with JSON only: {\"consider\": true|false, \"tag\": \"new_question\"|\"ongoing_discussion\"|\"statement\"|\"noise\"}. \
consider=true only when the message is a support question the bot should try to answer \
(a new question, or a follow-up in an ongoing problem discussion). \
Greetings, thanks, stickers, emoji and small talk are noise.";

pub const SPANS_SYSTEM: &str = "\
You find completed or in-progress support cases in a numbered chat buffer. \
Each block is delimited by '### MSG idx=<i> lines=<a>-<b>'. \
Reply with JSON only: {\"spans\": [{\"start_idx\": <i>, \"end_idx\": <j>}, ...]} \
where each span is an inclusive block range covering exactly one problem discussion. \
Spans must be sorted ascending and must not overlap. \
Return {\"spans\": []} when no case is present.";

pub const STRUCTURE_SYSTEM: &str = "\
You turn one support-chat excerpt into a structured case. \
Reply with JSON only: \
{\"keep\": true|false, \"status\": \"open\"|\"solved\", \"problem_title\": \"...\", \
\"problem_summary\": \"...\", \"solution_summary\": \"...\", \"tags\": [\"...\"]}. \
keep=false when the excerpt is not a real support problem. \
status=solved only when the excerpt contains a working fix; put that fix in solution_summary. \
Write title and summaries in the language of the excerpt.";

pub const RESOLVE_SYSTEM: &str = "\
You check whether an open support case has been resolved in the newer chat text. \
Reply with JSON only: {\"resolved\": true|false, \"solution_summary\": \"...\"}. \
resolved=true only when the chat contains a concrete confirmed fix for this exact case; \
then solution_summary must describe that fix.";

pub const ANSWER_SYSTEM: &str = "\
You are a technical-support assistant answering in a group chat. \
Use ONLY the provided context cases. Answer in 1-2 sentences in the {lang} language \
and include the case link given in the context. \
If the context says there are no relevant cases, or none of them actually answers \
the question, reply with exactly [[TAG_ADMIN]] and nothing else.";

/// Marker line the answer prompt uses when retrieval came back empty.
pub const NO_RELEVANT_CASES: &str = "no relevant cases";

pub fn image_user(context_text: &str) -> String {
    if context_text.trim().is_empty() {
        "Describe this image.".to_string()
    } else {
        format!(
            "Describe this image. It was attached to the message: {}",
            context_text
        )
    }
}

pub fn gate_user(message: &str, recent_context: &str) -> String {
    format!(
        "Recent messages:\n{}\n\nNew message:\n{}",
        recent_context, message
    )
}

pub fn resolve_user(title: &str, problem: &str, buffer_text: &str) -> String {
    format!(
        "Open case:\nTitle: {}\nProblem: {}\n\nNewer chat:\n{}",
        title, problem, buffer_text
    )
}

pub fn answer_system(lang: &str) -> String {
    ANSWER_SYSTEM.replace("{lang}", lang)
}

pub fn answer_user(question: &str, retrieved_context: &str) -> String {
    format!("Context:\n{}\n\nQuestion:\n{}", retrieved_context, question)
}

/// Appended to the user turn on a JSON re-ask after a parse failure.
pub const RETRY_SUFFIX: &str = "\n\nYour previous reply was not valid JSON for the required schema. Reply with ONLY the JSON object.";
