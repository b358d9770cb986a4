//! Sample domain data for tests: a populated character state and a short
//! opening conversation, both shaped to the default character schema
//! (`storyforge_engine::schema::default_schema`).

use storyforge_types::{CharacterState, Message};

/// A character state with every default-schema field filled in, rather than
/// the all-placeholder state `blank_character_state` produces.
pub fn sample_character_state() -> CharacterState {
    let mut state = CharacterState::new();
    state.set("name", serde_json::json!("林向"));
    state.set("gene_lock", serde_json::json!("未覺醒"));
    state.set("physique", serde_json::json!("C級"));
    state.set("spirit", serde_json::json!("D級"));
    state.set("reward_points", serde_json::json!(120));
    state.set("current_status", serde_json::json!("健康"));
    state.set("inventory", serde_json::json!(["應急手電筒", "乾糧"]));
    state.set("completed_missions", serde_json::json!([]));
    state.set("relationships", serde_json::json!({}));
    state
}

/// A minimal two-message opening conversation (user then GM), the shape
/// stories import as `parsed_conversation.json`.
pub fn sample_conversation() -> Vec<Message> {
    vec![
        Message::user(0, "我睜開眼睛，發現自己站在一條陌生的街道上。"),
        Message::gm(1, "風從巷口吹來，帶著鐵鏽味。遠處傳來警報聲。"),
    ]
}
