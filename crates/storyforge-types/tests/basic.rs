use storyforge_types::{BranchId, LoreCategory, Npc, RelationshipValue};

#[test]
fn branch_id_generate_has_expected_shape() {
    let id = BranchId::generate();
    assert!(id.as_str().starts_with("branch_"));
    assert_eq!(id.as_str().len(), "branch_".len() + 8);
}

#[test]
fn root_branch_id_is_main() {
    assert!(BranchId::root().is_root());
    assert!(!BranchId::generate().is_root());
}

#[test]
fn lore_category_parses_bracketed_and_trimmed_forms() {
    assert_eq!(LoreCategory::parse("NPC"), Some(LoreCategory::Npc));
    assert_eq!(
        LoreCategory::parse("【體系】"),
        Some(LoreCategory::Framework)
    );
    assert_eq!(LoreCategory::parse("不存在的分類"), None);
}

#[test]
fn relationship_value_collapses_detailed_form() {
    let detailed = RelationshipValue::Detailed {
        summary: Some("摯友".to_string()),
        description: None,
        kind: None,
    };
    assert_eq!(detailed.as_display(), "摯友");

    let text = RelationshipValue::Text("  盟友  ".to_string());
    assert_eq!(text.as_display(), "盟友");
}

#[test]
fn npc_extra_fields_round_trip() {
    let json = serde_json::json!({
        "name": "艾莉絲",
        "role": "嚮導",
        "custom_field": "保留未知欄位"
    });
    let npc: Npc = serde_json::from_value(json).unwrap();
    assert_eq!(npc.name, "艾莉絲");
    assert_eq!(
        npc.extra.get("custom_field").and_then(|v| v.as_str()),
        Some("保留未知欄位")
    );
}
