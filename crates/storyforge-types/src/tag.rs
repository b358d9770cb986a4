use serde_json::Value;

/// The five families of bracketed side-effect tags a GM response may embed
/// (§4.7). Both bracket styles (`<!--X ... X-->` and `[X ... X]`) parse to
/// the same family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagFamily {
    State,
    Lore,
    Npc,
    Event,
    Img,
    Time,
}

impl TagFamily {
    pub fn keyword(&self) -> &'static str {
        match self {
            TagFamily::State => "STATE",
            TagFamily::Lore => "LORE",
            TagFamily::Npc => "NPC",
            TagFamily::Event => "EVENT",
            TagFamily::Img => "IMG",
            TagFamily::Time => "TIME",
        }
    }
}

/// A successfully parsed tag payload. Malformed JSON payloads are dropped
/// silently during extraction (§4.7: "the core prefers partial progress
/// over aborting the turn") and never reach this type.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedTag {
    State(Value),
    Lore(Value),
    Npc(Value),
    Event(Value),
    Img(String),
    /// Days to advance the world clock by (already converted from an
    /// `hours:` payload if that's how the model wrote it).
    Time(f64),
}
