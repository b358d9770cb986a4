use crate::db::Database;
use crate::keywords::{extract_bracket_tags, extract_keywords, score, strip_inline_meta};
use anyhow::{Context, Result};
use rusqlite::OptionalExtension;
use std::path::Path;
use storyforge_types::{LoreCategory, LoreEntry, LORE_PLACEHOLDER};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS lore (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    category TEXT NOT NULL,
    topic    TEXT NOT NULL UNIQUE,
    content  TEXT NOT NULL,
    tags     TEXT NOT NULL DEFAULT ''
);
";

const CONTENT_TRUNCATE_LEN: usize = 800;
const DEFAULT_SEARCH_LIMIT: usize = 5;

/// A scored lore search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct LoreHit {
    pub category: String,
    pub topic: String,
    pub content: String,
    pub tags: String,
    pub score: i64,
}

/// SQLite-backed search index over a story's lore entries. The JSON file
/// (`world_lore.json`) is the source of truth; this index is rebuilt from
/// it wholesale rather than incrementally migrated.
pub struct LoreIndex {
    db: Database,
}

impl LoreIndex {
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

    /// Clears the index and reloads it from `entries`. Entries whose
    /// content is still the unfilled placeholder, or whose category isn't
    /// one of the recognized seven, are dropped.
    pub fn rebuild(&self, entries: &[LoreEntry]) -> Result<usize> {
        self.db.conn().execute("DELETE FROM lore", [])?;
        let mut skipped = 0usize;
        for entry in entries {
            if entry.content.starts_with(LORE_PLACEHOLDER) {
                continue;
            }
            let Some(category) = LoreCategory::parse(&entry.category) else {
                skipped += 1;
                continue;
            };
            let tags = extract_bracket_tags(&entry.content).join(",");
            self.db.conn().execute(
                "INSERT OR REPLACE INTO lore (category, topic, content, tags) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![category.as_str(), entry.topic, entry.content, tags],
            )?;
        }
        Ok(skipped)
    }

    /// Inserts a new entry or updates the existing one with the same
    /// topic (topic is the natural key).
    pub fn upsert(&self, entry: &LoreEntry) -> Result<()> {
        let topic = entry.topic.trim();
        if topic.is_empty() {
            return Ok(());
        }
        let tags = extract_bracket_tags(&entry.content).join(",");
        let category = entry.category.as_str();
        let existing: Option<i64> = self
            .db
            .conn()
            .query_row(
                "SELECT id FROM lore WHERE topic = ?1",
                [topic],
                |row| row.get(0),
            )
            .optional()
            .context("looking up existing lore topic")?;
        if existing.is_some() {
            self.db.conn().execute(
                "UPDATE lore SET category=?1, content=?2, tags=?3 WHERE topic=?4",
                rusqlite::params![category, entry.content, tags, topic],
            )?;
        } else {
            self.db.conn().execute(
                "INSERT INTO lore (category, topic, content, tags) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![category, topic, entry.content, tags],
            )?;
        }
        Ok(())
    }

    pub fn delete(&self, topic: &str) -> Result<()> {
        self.db
            .conn()
            .execute("DELETE FROM lore WHERE topic = ?1", [topic])?;
        Ok(())
    }

    pub fn all_entries(&self) -> Result<Vec<LoreHit>> {
        let mut stmt = self
            .db
            .conn()
            .prepare("SELECT category, topic, content, tags FROM lore ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(LoreHit {
                category: row.get(0)?,
                topic: row.get(1)?,
                content: row.get(2)?,
                tags: row.get(3)?,
                score: 0,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// CJK bigram/trigram scored search over topic/content/tags
    /// (`10*topic_hits + 5*tag_hits + 1*content_hits`).
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<LoreHit>> {
        let keywords = extract_keywords(query);
        let mut hits = Vec::new();
        for hit in self.all_entries()? {
            let s = score(&keywords, &hit.topic, &hit.tags, &hit.content);
            if s > 0 {
                hits.push(LoreHit { score: s, ..hit });
            }
        }
        hits.sort_by(|a, b| b.score.cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    pub fn search_by_tags(&self, tags: &[String], limit: usize) -> Result<Vec<LoreHit>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let clauses = vec!["tags LIKE ?"; tags.len()].join(" OR ");
        let sql = format!(
            "SELECT category, topic, content, tags FROM lore WHERE ({clauses}) LIMIT ?"
        );
        let mut stmt = self.db.conn().prepare(&sql)?;
        let mut params: Vec<String> = tags.iter().map(|t| format!("%{t}%")).collect();
        let limit_str = limit.to_string();
        let param_refs: Vec<&dyn rusqlite::ToSql> = {
            params.push(limit_str);
            params.iter().map(|p| p as &dyn rusqlite::ToSql).collect()
        };
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LoreHit {
                category: row.get(0)?,
                topic: row.get(1)?,
                content: row.get(2)?,
                tags: row.get(3)?,
                score: 0,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Builds the hierarchical table-of-contents injected into the system
    /// prompt: one `### 【category】` section per category, topics split
    /// on the full-width colon into a nested tree.
    pub fn table_of_contents(&self) -> Result<String> {
        let entries = self.all_entries()?;
        if entries.is_empty() {
            return Ok("（尚無已確立的世界設定）".to_string());
        }

        let mut categories: Vec<String> = Vec::new();
        let mut by_category: std::collections::HashMap<String, Vec<&LoreHit>> =
            std::collections::HashMap::new();
        for entry in &entries {
            by_category
                .entry(entry.category.clone())
                .or_insert_with(|| {
                    categories.push(entry.category.clone());
                    Vec::new()
                })
                .push(entry);
        }

        let mut lines = Vec::new();
        for category in &categories {
            lines.push(format!("### 【{category}】"));
            let mut tree: TocNode = TocNode::default();
            for entry in &by_category[category] {
                let mut node = &mut tree;
                for part in entry.topic.split('：') {
                    node = node.children.entry(part.to_string()).or_default();
                }
            }
            render_toc(&tree, 0, &mut lines);
            lines.push(String::new());
        }

        Ok(lines.join("\n").trim().to_string())
    }

    /// Formats the top search hits for system-prompt injection, stripping
    /// inline `[tag:]`/`[source:]` markers and truncating long content.
    pub fn relevant_lore_block(&self, user_message: &str, limit: usize) -> Result<String> {
        let hits = self.search(user_message, limit)?;
        if hits.is_empty() {
            return Ok(String::new());
        }
        let mut lines = vec!["[相關世界設定]".to_string()];
        for hit in hits {
            let mut content = strip_inline_meta(&hit.content);
            if content.chars().count() > CONTENT_TRUNCATE_LEN {
                let truncated: String = content.chars().take(CONTENT_TRUNCATE_LEN).collect();
                content = format!("{truncated}…（截斷）");
            }
            lines.push(format!("#### {}：{}", hit.category, hit.topic));
            lines.push(content);
            lines.push(String::new());
        }
        Ok(lines.join("\n"))
    }
}

impl Default for LoreIndex {
    fn default() -> Self {
        Self::open_in_memory().expect("in-memory sqlite should always open")
    }
}

#[derive(Default)]
struct TocNode {
    children: std::collections::BTreeMap<String, TocNode>,
}

fn render_toc(node: &TocNode, depth: usize, lines: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    for (key, child) in &node.children {
        lines.push(format!("{indent}- {key}"));
        if !child.children.is_empty() {
            render_toc(child, depth + 1, lines);
        }
    }
}
