use serde::{Deserialize, Serialize};

/// The closed set of lore categories (`lore_db.VALID_LORE_CATEGORIES`).
/// Rows outside this set are dropped on rebuild (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoreCategory {
    #[serde(rename = "主神設定與規則")]
    SystemRules,
    #[serde(rename = "體系")]
    Framework,
    #[serde(rename = "商城")]
    Shop,
    #[serde(rename = "副本世界觀")]
    DungeonLore,
    #[serde(rename = "場景")]
    Scene,
    #[serde(rename = "NPC")]
    Npc,
    #[serde(rename = "故事追蹤")]
    StoryTracking,
}

impl LoreCategory {
    pub const ALL: [LoreCategory; 7] = [
        LoreCategory::SystemRules,
        LoreCategory::Framework,
        LoreCategory::Shop,
        LoreCategory::DungeonLore,
        LoreCategory::Scene,
        LoreCategory::Npc,
        LoreCategory::StoryTracking,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoreCategory::SystemRules => "主神設定與規則",
            LoreCategory::Framework => "體系",
            LoreCategory::Shop => "商城",
            LoreCategory::DungeonLore => "副本世界觀",
            LoreCategory::Scene => "場景",
            LoreCategory::Npc => "NPC",
            LoreCategory::StoryTracking => "故事追蹤",
        }
    }

    /// Parses a raw category string, trimming the `【】` brackets a model
    /// sometimes wraps the category in (`lore_db.rebuild_index`).
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim().trim_matches(['【', '】']).trim();
        Self::ALL.into_iter().find(|c| c.as_str() == trimmed)
    }
}

/// `{category, topic, content, tags}` — topic is unique per story (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoreEntry {
    pub category: String,
    pub topic: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcategory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
}

/// Sentinel content marking a lore stub not yet filled in
/// (`content.startswith("（待建立）")` in the original).
pub const LORE_PLACEHOLDER: &str = "（待建立）";
