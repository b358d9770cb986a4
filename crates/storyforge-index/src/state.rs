use crate::db::Database;
use anyhow::Result;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use storyforge_types::{CharacterState, Npc};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS state_entries (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    category   TEXT NOT NULL,
    entry_key  TEXT NOT NULL,
    content    TEXT NOT NULL,
    tags       TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL,
    UNIQUE(category, entry_key)
);
CREATE INDEX IF NOT EXISTS idx_state_entries_category ON state_entries(category);
";

const NPC_TIER_ALLOWLIST: &[&str] = &[
    "D-", "D", "D+", "C-", "C", "C+", "B-", "B", "B+", "A-", "A", "A+", "S-", "S", "S+",
];

fn category_label(category: &str) -> &str {
    match category {
        "inventory" => "道具",
        "ability" => "技能",
        "relationship" => "關係",
        "npc" => "NPC 檔案",
        "mission" => "已完成任務",
        "system" => "體系",
        other => other,
    }
}

/// Optional extra signal used to boost certain categories' scores for the
/// current narrative moment (e.g. combat favors inventory/ability/npc).
#[derive(Debug, Clone, Default)]
pub struct SearchContext {
    pub phase: String,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub token_budget: Option<usize>,
    pub must_include_keys: Vec<String>,
    pub context: Option<SearchContext>,
    pub category_limits: HashMap<String, usize>,
    pub max_items: Option<usize>,
}

struct Row {
    category: String,
    entry_key: String,
    content: String,
    tags: String,
}

/// Per-branch SQLite summary index over character state + NPCs, built
/// lazily from `character_state.json` / `npcs.json` (§4.5).
pub struct StateIndex {
    db: Database,
}

impl StateIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::open(path)?;
        db.execute_batch(SCHEMA)?;
        Ok(Self { db })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        db.execute_batch(SCHEMA)?;
        Ok(Self { db })
    }

    pub fn is_empty(&self) -> Result<bool> {
        let count: i64 =
            self.db
                .conn()
                .query_row("SELECT COUNT(*) FROM state_entries", [], |r| r.get(0))?;
        Ok(count == 0)
    }

    fn replace_categories(&self, categories: &[(&str, Vec<(String, String, &str)>)]) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        for (category, rows) in categories {
            self.db
                .conn()
                .execute("DELETE FROM state_entries WHERE category = ?1", [*category])?;
            for (key, content, tags) in rows {
                if key.trim().is_empty() {
                    continue;
                }
                self.db.conn().execute(
                    "INSERT INTO state_entries (category, entry_key, content, tags, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![category, key.trim(), content, tags, now],
                )?;
            }
        }
        Ok(())
    }

    pub fn upsert_entry(&self, category: &str, entry_key: &str, content: &str, tags: &str) -> Result<()> {
        let key = entry_key.trim();
        let cat = category.trim();
        if key.is_empty() || cat.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().to_rfc3339();
        self.db.conn().execute(
            "INSERT INTO state_entries (category, entry_key, content, tags, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(category, entry_key) DO UPDATE SET content=excluded.content, tags=excluded.tags, updated_at=excluded.updated_at",
            rusqlite::params![cat, key, content, tags, now],
        )?;
        Ok(())
    }

    pub fn delete_entry(&self, category: &str, entry_key: &str) -> Result<()> {
        self.db.conn().execute(
            "DELETE FROM state_entries WHERE category = ?1 AND entry_key = ?2",
            rusqlite::params![category.trim(), entry_key.trim()],
        )?;
        Ok(())
    }

    /// Rebuilds every category from `state` and `npcs`, replacing the
    /// table contents wholesale. Returns the number of rows written.
    pub fn rebuild_from_json(&self, state: &CharacterState, npcs: &[Npc]) -> Result<usize> {
        let inv_map = to_inventory_map(state.get("inventory"));
        let inv_rows: Vec<(String, String, &str)> = inv_map
            .into_iter()
            .map(|(k, v)| (k, v, "道具"))
            .collect();

        let ability_rows: Vec<(String, String, &str)> = state
            .get("abilities")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| (s.to_string(), String::new(), "技能"))
                    .collect()
            })
            .unwrap_or_default();

        let rel_rows: Vec<(String, String, &str)> = state
            .get("relationships")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter(|(k, _)| !k.trim().is_empty())
                    .map(|(k, v)| (k.trim().to_string(), rel_to_str(v), "關係"))
                    .collect()
            })
            .unwrap_or_default();

        let mission_rows: Vec<(String, String, &str)> = state
            .get("completed_missions")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| (s.to_string(), String::new(), "任務"))
                    .collect()
            })
            .unwrap_or_default();

        let system_rows: Vec<(String, String, &str)> = state
            .get("systems")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter(|(k, _)| !k.trim().is_empty())
                    .map(|(k, v)| (k.trim().to_string(), value_to_display(v), "體系"))
                    .collect()
            })
            .unwrap_or_default();

        let npc_rows: Vec<(String, String, &str)> = npcs
            .iter()
            .filter(|npc| !npc.name.trim().is_empty())
            .map(|npc| {
                let tags = if is_archived(npc) { "NPC|ARCHIVED" } else { "NPC" };
                (npc.name.trim().to_string(), build_npc_content(npc), tags)
            })
            .collect();

        let total = inv_rows.len()
            + ability_rows.len()
            + rel_rows.len()
            + mission_rows.len()
            + system_rows.len()
            + npc_rows.len();

        self.replace_categories(&[
            ("inventory", inv_rows),
            ("ability", ability_rows),
            ("relationship", rel_rows),
            ("mission", mission_rows),
            ("system", system_rows),
            ("npc", npc_rows),
        ])?;

        Ok(total)
    }

    fn all_rows(&self) -> Result<Vec<Row>> {
        let mut stmt = self
            .db
            .conn()
            .prepare("SELECT category, entry_key, content, tags FROM state_entries")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(Row {
                    category: r.get(0)?,
                    entry_key: r.get(1)?,
                    content: r.get(2)?,
                    tags: r.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Scored, quota-capped, token-budgeted search over state entries,
    /// formatted for system-prompt injection.
    pub fn search(&self, query: &str, options: &SearchOptions) -> Result<String> {
        if self.is_empty()? {
            return Ok(String::new());
        }
        let rows = self.all_rows()?;
        if rows.is_empty() {
            return Ok(String::new());
        }

        let keywords = extract_keywords(query);
        let forced_keys: HashSet<&str> = options
            .must_include_keys
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();

        let mut forced = Vec::new();
        let mut scored: Vec<(f64, &Row)> = Vec::new();
        for row in &rows {
            if forced_keys.contains(row.entry_key.as_str()) {
                forced.push(row);
                continue;
            }
            if row.category == "npc" && has_archived_tag(&row.tags) {
                continue;
            }
            let mut s = score_row(row, &keywords);
            s = apply_context_boost(s, &row.category, options.context.as_ref());
            if s > 0.0 {
                scored.push((s, row));
            }
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut selected: Vec<&Row> = Vec::new();
        for row in forced {
            let ident = (row.category.clone(), row.entry_key.clone());
            if seen.insert(ident) {
                selected.push(row);
            }
        }

        let mut used_counts: HashMap<String, usize> = HashMap::new();
        let mut picked = 0usize;
        for (_, row) in scored {
            let ident = (row.category.clone(), row.entry_key.clone());
            if seen.contains(&ident) {
                continue;
            }
            if let Some(&cap) = options.category_limits.get(&row.category) {
                if *used_counts.get(&row.category).unwrap_or(&0) >= cap {
                    continue;
                }
            }
            if let Some(max_items) = options.max_items {
                if max_items > 0 && picked >= max_items {
                    break;
                }
            }
            seen.insert(ident);
            *used_counts.entry(row.category.clone()).or_insert(0) += 1;
            picked += 1;
            selected.push(row);
        }

        if selected.is_empty() {
            return Ok(String::new());
        }

        let mut grouped: HashMap<&str, Vec<String>> = HashMap::new();
        let mut used = 0usize;
        for row in &selected {
            let line = line_for_row(&row.category, &row.entry_key, &row.content);
            let est = line.chars().count();
            let is_forced = forced_keys.contains(row.entry_key.as_str());
            if let Some(budget) = options.token_budget {
                if budget > 0 && used + est > budget && !grouped.is_empty() && !is_forced {
                    continue;
                }
            }
            grouped.entry(category_key(&row.category)).or_default().push(line);
            used += est;
        }

        if grouped.is_empty() {
            return Ok(String::new());
        }

        let order = ["inventory", "ability", "npc", "relationship", "mission", "system"];
        let mut lines = vec!["[相關角色狀態]".to_string()];
        for category in order {
            if let Some(items) = grouped.get(category) {
                lines.push(format!("#### {}", category_label(category)));
                lines.extend(items.iter().cloned());
            }
        }
        Ok(lines.join("\n"))
    }

    pub fn summary(&self) -> Result<String> {
        if self.is_empty()? {
            return Ok("（尚無狀態索引）".to_string());
        }
        let mut stmt = self
            .db
            .conn()
            .prepare("SELECT category, COUNT(*) FROM state_entries GROUP BY category")?;
        let counts: HashMap<String, i64> = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        let order = ["inventory", "ability", "relationship", "npc", "mission", "system"];
        let parts: Vec<String> = order
            .iter()
            .filter_map(|c| counts.get(*c).filter(|&&n| n > 0).map(|n| format!("{}{}", category_label(c), n)))
            .collect();
        if parts.is_empty() {
            Ok("（尚無狀態索引）".to_string())
        } else {
            Ok(parts.join("、"))
        }
    }
}

fn category_key(category: &str) -> &'static str {
    match category {
        "inventory" => "inventory",
        "ability" => "ability",
        "relationship" => "relationship",
        "npc" => "npc",
        "mission" => "mission",
        "system" => "system",
        _ => "system",
    }
}

fn line_for_row(category: &str, key: &str, content: &str) -> String {
    match category {
        "inventory" | "ability" | "mission" => {
            if content.is_empty() {
                format!("- {key}")
            } else {
                format!("- {key}（{content}）")
            }
        }
        "relationship" | "system" | "npc" => {
            if content.is_empty() {
                format!("- {key}")
            } else {
                format!("- {key}：{content}")
            }
        }
        _ => format!("- {key}"),
    }
}

fn has_archived_tag(tags: &str) -> bool {
    tags.split('|').any(|p| p.trim().eq_ignore_ascii_case("ARCHIVED"))
}

fn apply_context_boost(score: f64, category: &str, context: Option<&SearchContext>) -> f64 {
    let Some(ctx) = context else { return score };
    let mut s = score;
    if ctx.status.contains("戰鬥") && matches!(category, "inventory" | "ability" | "npc") {
        s *= 1.4;
    }
    if (ctx.phase.contains("主神空間") || ctx.phase.contains("空間")) && matches!(category, "inventory" | "mission") {
        s *= 1.3;
    }
    if ctx.phase.contains("副本") && matches!(category, "npc" | "ability") {
        s *= 1.3;
    }
    s
}

fn score_row(row: &Row, keywords: &HashSet<String>) -> f64 {
    let mut score = 0.0;
    for kw in keywords {
        let in_key = row.entry_key.contains(kw.as_str());
        let in_tags = row.tags.contains(kw.as_str());
        let in_content = row.content.contains(kw.as_str());
        if in_key {
            score += 10.0;
        }
        if in_tags {
            score += 5.0;
        }
        if in_content {
            score += 1.0;
        }
    }
    score
}

fn extract_keywords(query: &str) -> HashSet<String> {
    let mut keywords = crate::keywords::extract_keywords(query);
    let lowered = query.to_lowercase();
    let mut token = String::new();
    let mut push_token = |t: &mut String, keywords: &mut HashSet<String>| {
        if t.chars().count() >= 2 {
            keywords.insert(std::mem::take(t));
        } else {
            t.clear();
        }
    };
    for ch in lowered.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '+' || ch == '-' {
            token.push(ch);
        } else {
            push_token(&mut token, &mut keywords);
        }
    }
    push_token(&mut token, &mut keywords);
    keywords
}

fn rel_to_str(value: &Value) -> String {
    match value {
        Value::Object(map) => map
            .get("summary")
            .or_else(|| map.get("description"))
            .or_else(|| map.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string(),
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => value_to_display(other),
    }
}

fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn to_inventory_map(inv: Option<&Value>) -> Vec<(String, String)> {
    match inv {
        Some(Value::Object(map)) => map
            .iter()
            .filter(|(k, _)| !k.trim().is_empty())
            .map(|(k, v)| (k.trim().to_string(), value_to_display(v)))
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_item_to_kv)
            .collect(),
        _ => Vec::new(),
    }
}

fn extract_item_base_name(item: &str) -> String {
    let item = item.trim();
    if let Some(idx) = item.find('—') {
        return item[..idx].trim().to_string();
    }
    if let Some(idx) = item.find(" - ") {
        return item[..idx].trim().to_string();
    }
    if let Some(open) = item.rfind(['（', '(']) {
        if item.ends_with('）') || item.ends_with(')') {
            return item[..open].trim().to_string();
        }
    }
    if let Some(x_idx) = item.rfind('×') {
        if item[x_idx + '×'.len_utf8()..].chars().all(|c| c.is_ascii_digit())
            && !item[x_idx + '×'.len_utf8()..].is_empty()
        {
            return item[..x_idx].trim().to_string();
        }
    }
    item.to_string()
}

fn parse_item_to_kv(item: &str) -> (String, String) {
    if let Some(idx) = item.find(" — ") {
        let (key, val) = item.split_at(idx);
        return (key.trim().to_string(), val[" — ".len()..].trim().to_string());
    }
    if let Some(idx) = item.find('—') {
        let (key, val) = item.split_at(idx);
        return (key.trim().to_string(), val['—'.len_utf8()..].trim().to_string());
    }
    let base = extract_item_base_name(item);
    let mut suffix = item[base.len().min(item.len())..].trim().to_string();
    if (suffix.starts_with('（') && suffix.ends_with('）'))
        || (suffix.starts_with('(') && suffix.ends_with(')'))
    {
        suffix = suffix
            .trim_start_matches(['（', '('])
            .trim_end_matches(['）', ')'])
            .to_string();
    }
    (base, suffix)
}

fn normalize_npc_tier(raw: &str) -> Option<String> {
    let translated: String = raw
        .trim()
        .to_uppercase()
        .chars()
        .map(|c| match c {
            '－' | '—' | '–' | '−' | '﹣' | 'ー' => '-',
            '＋' => '+',
            other => other,
        })
        .collect();
    let tier = translated.replace('級', "");
    let tier = tier.trim().to_string();
    NPC_TIER_ALLOWLIST.contains(&tier.as_str()).then_some(tier)
}

fn is_archived(npc: &Npc) -> bool {
    matches!(npc.lifecycle_status, storyforge_types::LifecycleStatus::Archived)
}

fn build_npc_content(npc: &Npc) -> String {
    let mut parts = Vec::new();
    let role = npc.role.trim();
    if !role.is_empty() {
        parts.push(format!("定位:{role}"));
    }
    if let Some(tier) = npc.tier.as_deref().and_then(normalize_npc_tier) {
        parts.push(format!("戰力:{tier}級"));
    }
    let rel = npc.relationship_to_player.as_display();
    if !rel.is_empty() {
        parts.push(format!("關係:{rel}"));
    }
    let status = npc.current_status.trim();
    if !status.is_empty() {
        parts.push(format!("狀態:{status}"));
    }
    if !npc.notable_traits.is_empty() {
        parts.push(format!("特質:{}", npc.notable_traits.join("、")));
    }
    parts.join("；")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use storyforge_types::RelationshipValue;

    fn sample_state() -> CharacterState {
        let mut state = CharacterState::new();
        state.set(
            "inventory",
            json!({"治療藥水": "3瓶", "鎮魂符×5": ""}),
        );
        state.set("abilities", json!(["火球術", "治癒術"]));
        state.set("relationships", json!({"小翼": {"summary": "摯友"}}));
        state.set("completed_missions", json!(["新手試煉"]));
        state.set("systems", json!({"煉體": "第二階"}));
        state
    }

    fn sample_npc() -> Npc {
        Npc {
            id: None,
            name: "小翼".to_string(),
            role: "嚮導".to_string(),
            appearance: String::new(),
            personality: Default::default(),
            backstory: String::new(),
            current_status: "隨行中".to_string(),
            notable_traits: vec!["忠誠".to_string()],
            relationship_to_player: RelationshipValue::Text("摯友".to_string()),
            tier: Some("A".to_string()),
            lifecycle_status: Default::default(),
            archived_reason: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn rebuild_populates_every_category() {
        let index = StateIndex::open_in_memory().unwrap();
        let total = index
            .rebuild_from_json(&sample_state(), &[sample_npc()])
            .unwrap();
        assert_eq!(total, 6);
        assert!(!index.is_empty().unwrap());
    }

    #[test]
    fn search_finds_matching_inventory_entry() {
        let index = StateIndex::open_in_memory().unwrap();
        index.rebuild_from_json(&sample_state(), &[sample_npc()]).unwrap();
        let block = index.search("藥水", &SearchOptions::default()).unwrap();
        assert!(block.contains("治療藥水"));
    }

    #[test]
    fn npc_build_content_joins_known_fields() {
        let content = build_npc_content(&sample_npc());
        assert!(content.contains("定位:嚮導"));
        assert!(content.contains("戰力:A級"));
        assert!(content.contains("關係:摯友"));
    }

    #[test]
    fn summary_lists_non_empty_categories() {
        let index = StateIndex::open_in_memory().unwrap();
        index.rebuild_from_json(&sample_state(), &[sample_npc()]).unwrap();
        let summary = index.summary().unwrap();
        assert!(summary.contains("道具"));
        assert!(summary.contains("NPC"));
    }
}
