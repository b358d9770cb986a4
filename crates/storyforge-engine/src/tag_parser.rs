//! Single enclosure-grammar scanner for the five bracketed side-effect tag
//! families (§4.7, §9 "Regex+JSON tag extraction → parser combinator"). Both
//! bracket styles (`<!--X ... X-->` and `[X ... X]`) parse identically,
//! collapsing what the original implements as five near-duplicate regex
//! extractors into one scanner with per-family payload dispatch.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use storyforge_types::{ParsedTag, TagFamily};

const FAMILIES: [TagFamily; 6] = [
    TagFamily::State,
    TagFamily::Lore,
    TagFamily::Npc,
    TagFamily::Event,
    TagFamily::Img,
    TagFamily::Time,
];

fn tag_regex(family: TagFamily) -> &'static Regex {
    static STATE: Lazy<Regex> = Lazy::new(|| enclosure("STATE", false));
    static LORE: Lazy<Regex> = Lazy::new(|| enclosure("LORE", false));
    static NPC: Lazy<Regex> = Lazy::new(|| enclosure("NPC", false));
    static EVENT: Lazy<Regex> = Lazy::new(|| enclosure("EVENT", false));
    static IMG: Lazy<Regex> = Lazy::new(|| {
        Regex::new(&format!(
            r"(?s){}IMG\s+prompt:\s*(.*?)\s*IMG{}",
            open(),
            close()
        ))
        .expect("valid IMG tag regex")
    });
    static TIME: Lazy<Regex> = Lazy::new(|| enclosure("TIME", true));

    match family {
        TagFamily::State => &STATE,
        TagFamily::Lore => &LORE,
        TagFamily::Npc => &NPC,
        TagFamily::Event => &EVENT,
        TagFamily::Img => &IMG,
        TagFamily::Time => &TIME,
    }
}

fn open() -> &'static str {
    r"(?:<!--|\[)"
}

fn close() -> &'static str {
    r"(?:-->|\])"
}

/// Builds `open KEYWORD <body> KEYWORD close`. TIME's body is a bare
/// `days:N`/`hours:N` token rather than JSON, so its keyword is followed by
/// whitespace instead of being glued directly to the payload.
fn enclosure(keyword: &str, bare_payload: bool) -> Regex {
    let sep = if bare_payload { r"\s+" } else { r"\s*" };
    Regex::new(&format!(
        r"(?s){open}{kw}{sep}(.*?)\s*{kw}{close}",
        open = open(),
        kw = keyword,
        close = close(),
        sep = sep,
    ))
    .expect("valid tag regex")
}

/// All tags parsed out of one GM response, plus the cleaned narrative text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedTags {
    pub state: Vec<Value>,
    pub lore: Vec<Value>,
    pub npc: Vec<Value>,
    pub event: Vec<Value>,
    /// First non-empty IMG prompt wins (§4.7: "first prompt wins").
    pub image_prompt: Option<String>,
    /// One entry per TIME tag found, already converted to days.
    pub time_advances: Vec<f64>,
}

impl ExtractedTags {
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
            && self.lore.is_empty()
            && self.npc.is_empty()
            && self.event.is_empty()
            && self.image_prompt.is_none()
            && self.time_advances.is_empty()
    }
}

/// Repeatedly matches `family`'s regex against `text`, removing each match
/// (collapsing the surrounding whitespace the same way the original's
/// `text[:m.start()].rstrip() + text[m.end():]` does) and handing the
/// captured payload to `on_match`.
fn strip_family(text: &mut String, family: TagFamily, mut on_match: impl FnMut(&str)) {
    loop {
        let re = tag_regex(family);
        let Some(m) = re.find(text) else { break };
        let start = m.start();
        let end = m.end();
        let payload = re.captures(text).unwrap().get(1).unwrap().as_str().to_string();
        on_match(&payload);
        let before = text[..start].trim_end();
        let after = &text[end..];
        *text = format!("{before}{after}").trim().to_string();
    }
}

/// Parses a TIME tag body (`days:N` or `hours:N`) into a day count. Any
/// other form (and unparseable numbers) yields `0.0` — TIME tags are
/// best-effort, never fatal to the turn.
pub fn parse_time_body(body: &str) -> f64 {
    let body = body.trim();
    if let Some(rest) = body.strip_prefix("days:") {
        return rest.trim().parse().unwrap_or(0.0);
    }
    if let Some(rest) = body.strip_prefix("hours:") {
        return rest.trim().parse::<f64>().map(|h| h / 24.0).unwrap_or(0.0);
    }
    0.0
}

/// Scans `text` for every known tag family and returns the cleaned text
/// plus everything it found. Malformed JSON payloads are dropped silently
/// (§4.7: "the core prefers partial progress over aborting the turn").
/// Extraction order matches the original: STATE, LORE, NPC, EVENT, IMG,
/// TIME.
pub fn extract_tags(text: &str) -> (String, ExtractedTags) {
    let mut remaining = text.to_string();
    let mut tags = ExtractedTags::default();

    for family in FAMILIES {
        match family {
            TagFamily::State => {
                strip_family(&mut remaining, family, |payload| {
                    if let Ok(v) = serde_json::from_str::<Value>(payload) {
                        tags.state.push(v);
                    }
                });
            }
            TagFamily::Lore => {
                strip_family(&mut remaining, family, |payload| {
                    if let Ok(v) = serde_json::from_str::<Value>(payload) {
                        tags.lore.push(v);
                    }
                });
            }
            TagFamily::Npc => {
                strip_family(&mut remaining, family, |payload| {
                    if let Ok(v) = serde_json::from_str::<Value>(payload) {
                        tags.npc.push(v);
                    }
                });
            }
            TagFamily::Event => {
                strip_family(&mut remaining, family, |payload| {
                    if let Ok(v) = serde_json::from_str::<Value>(payload) {
                        tags.event.push(v);
                    }
                });
            }
            TagFamily::Img => {
                strip_family(&mut remaining, family, |payload| {
                    let prompt = payload.trim();
                    if !prompt.is_empty() && tags.image_prompt.is_none() {
                        tags.image_prompt = Some(prompt.to_string());
                    }
                });
            }
            TagFamily::Time => {
                strip_family(&mut remaining, family, |payload| {
                    let days = parse_time_body(payload);
                    if days > 0.0 {
                        tags.time_advances.push(days);
                    }
                });
            }
        }
    }

    (remaining, tags)
}

/// As [`ParsedTag`]s rather than raw `serde_json::Value`s, for callers that
/// want the typed enum (e.g. a unified dispatch table).
pub fn extract_parsed_tags(text: &str) -> (String, Vec<ParsedTag>) {
    let (clean, tags) = extract_tags(text);
    let mut parsed = Vec::new();
    parsed.extend(tags.state.into_iter().map(ParsedTag::State));
    parsed.extend(tags.lore.into_iter().map(ParsedTag::Lore));
    parsed.extend(tags.npc.into_iter().map(ParsedTag::Npc));
    parsed.extend(tags.event.into_iter().map(ParsedTag::Event));
    if let Some(p) = tags.image_prompt {
        parsed.push(ParsedTag::Img(p));
    }
    parsed.extend(tags.time_advances.into_iter().map(ParsedTag::Time));
    (clean, parsed)
}

static CONTEXT_ECHO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\[(?:命運判定|命運骰結果|相關世界設定|相關事件追蹤|NPC 近期動態)\].*?(?:\n---\n|\n\n[^\[\n]|\z)")
        .expect("valid context-echo regex")
});

/// Strips any of the context-injection section titles the assembler (§4.8)
/// prepends to the user message, in case the model echoed them back
/// verbatim — otherwise they'd accumulate into the transcript turn after
/// turn (§4.7, second sweep).
pub fn strip_context_echo(text: &str) -> String {
    let stripped = CONTEXT_ECHO_RE.replace_all(text, "");
    let stripped = stripped.trim_start_matches("---").trim();
    stripped.replace("\n---\n", "\n").trim().to_string()
}
