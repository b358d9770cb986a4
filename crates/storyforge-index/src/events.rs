use crate::db::Database;
use crate::keywords::{extract_keywords, score};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use storyforge_types::{BranchId, Event, EventStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type     TEXT NOT NULL,
    title          TEXT NOT NULL,
    description    TEXT NOT NULL,
    message_index  INTEGER,
    branch_id      TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'planted',
    tags           TEXT NOT NULL DEFAULT '',
    related_titles TEXT NOT NULL DEFAULT '',
    created_at     TEXT NOT NULL
);
";

/// A scored event search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct EventHit {
    pub event: Event,
    pub score: i64,
}

/// Per-story SQLite log of planted/triggered/resolved/abandoned events,
/// keyed by branch. Unlike lore there's no JSON source of truth to rebuild
/// from — this index IS the store.
pub struct EventIndex {
    db: Database,
}

impl EventIndex {
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

    /// Inserts a new event and returns its assigned id.
    pub fn insert(&self, event: &Event) -> Result<i64> {
        let now = event.created_at;
        self.db.conn().execute(
            "INSERT INTO events (event_type, title, description, message_index, branch_id, status, tags, related_titles, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                event.event_type,
                event.title,
                event.description,
                event.message_index,
                event.branch_id.as_str(),
                event.status.as_str(),
                event.tags,
                event.related_titles,
                now.to_rfc3339(),
            ],
        )?;
        Ok(self.db.conn().last_insert_rowid())
    }

    pub fn update_status(&self, event_id: i64, status: EventStatus) -> Result<()> {
        self.db.conn().execute(
            "UPDATE events SET status = ?1 WHERE id = ?2",
            rusqlite::params![status.as_str(), event_id],
        )?;
        Ok(())
    }

    pub fn get(&self, branch: Option<&BranchId>, limit: usize) -> Result<Vec<Event>> {
        let mut stmt;
        let rows = match branch {
            Some(b) => {
                stmt = self.db.conn().prepare(
                    "SELECT * FROM events WHERE branch_id = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                stmt.query_map(rusqlite::params![b.as_str(), limit as i64], row_to_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                stmt = self
                    .db
                    .conn()
                    .prepare("SELECT * FROM events ORDER BY id DESC LIMIT ?1")?;
                stmt.query_map([limit as i64], row_to_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    pub fn get_by_id(&self, event_id: i64) -> Result<Option<Event>> {
        let mut stmt = self.db.conn().prepare("SELECT * FROM events WHERE id = ?1")?;
        let mut rows = stmt.query_map([event_id], row_to_event)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Copies `source`'s events into `target` for a fork. When
    /// `branch_point_index` is `Some`, only events at or before that index
    /// (plus legacy events with no index) are copied.
    pub fn copy_for_fork(
        &self,
        source: &BranchId,
        target: &BranchId,
        branch_point_index: Option<i64>,
    ) -> Result<()> {
        if source == target {
            return Ok(());
        }
        let rows: Vec<Event> = match branch_point_index {
            None => {
                let mut stmt = self.db.conn().prepare(
                    "SELECT * FROM events WHERE branch_id = ?1 ORDER BY id",
                )?;
                stmt.query_map([source.as_str()], row_to_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            Some(idx) => {
                let mut stmt = self.db.conn().prepare(
                    "SELECT * FROM events WHERE branch_id = ?1 AND (message_index <= ?2 OR message_index IS NULL) ORDER BY id",
                )?;
                stmt.query_map(rusqlite::params![source.as_str(), idx], row_to_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        for mut row in rows {
            row.branch_id = target.clone();
            self.insert(&row)?;
        }
        Ok(())
    }

    /// Merges `src`'s events into `dst` by title: new titles are inserted,
    /// existing titles have their status overwritten by the source's.
    pub fn merge_into(&self, src: &BranchId, dst: &BranchId) -> Result<()> {
        if src == dst {
            return Ok(());
        }
        let src_rows: Vec<Event> = {
            let mut stmt = self
                .db
                .conn()
                .prepare("SELECT * FROM events WHERE branch_id = ?1 ORDER BY id")?;
            stmt.query_map([src.as_str()], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        if src_rows.is_empty() {
            return Ok(());
        }

        let dst_title_to_id: HashMap<String, i64> = {
            let mut stmt = self
                .db
                .conn()
                .prepare("SELECT id, title FROM events WHERE branch_id = ?1")?;
            stmt.query_map([dst.as_str()], |row| {
                Ok((row.get::<_, String>(1)?, row.get::<_, i64>(0)?))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?
        };

        let mut by_title: HashMap<String, Event> = HashMap::new();
        for row in src_rows {
            by_title.insert(row.title.clone(), row);
        }

        for (title, row) in by_title {
            match dst_title_to_id.get(&title) {
                Some(&id) => self.update_status(id, row.status)?,
                None => {
                    let mut copy = row;
                    copy.branch_id = dst.clone();
                    self.insert(&copy)?;
                }
            }
        }
        Ok(())
    }

    pub fn delete_for_branch(&self, branch: &BranchId) -> Result<()> {
        self.db
            .conn()
            .execute("DELETE FROM events WHERE branch_id = ?1", [branch.as_str()])?;
        Ok(())
    }

    /// CJK-scored search, optionally restricted to one branch and to
    /// active (planted/triggered) events only.
    pub fn search(
        &self,
        query: &str,
        branch: Option<&BranchId>,
        limit: usize,
        active_only: bool,
    ) -> Result<Vec<EventHit>> {
        let keywords = extract_keywords(query);
        let active_filter = if active_only {
            " AND status IN ('planted', 'triggered')"
        } else {
            ""
        };
        let sql = match branch {
            Some(_) => format!("SELECT * FROM events WHERE branch_id = ?1{active_filter}"),
            None => format!("SELECT * FROM events WHERE 1=1{active_filter}"),
        };
        let mut stmt = self.db.conn().prepare(&sql)?;
        let rows: Vec<Event> = match branch {
            Some(b) => stmt
                .query_map([b.as_str()], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };

        let mut hits: Vec<EventHit> = rows
            .into_iter()
            .filter_map(|event| {
                let s = score(&keywords, &event.title, &event.tags, &event.description);
                (s > 0).then_some(EventHit { event, score: s })
            })
            .collect();
        hits.sort_by(|a, b| b.score.cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    /// Formatted block of up to `limit` active events relevant to
    /// `user_message`, for system-prompt injection.
    pub fn relevant_events_block(
        &self,
        user_message: &str,
        branch: &BranchId,
        limit: usize,
    ) -> Result<String> {
        let hits = self.search(user_message, Some(branch), limit, true)?;
        if hits.is_empty() {
            return Ok(String::new());
        }
        let mut lines = vec!["[相關事件追蹤]".to_string()];
        for hit in hits {
            let status_label = status_label(hit.event.status);
            let truncated: String = hit.event.description.chars().take(200).collect();
            lines.push(format!(
                "- [{}] {}（{}）：{}",
                hit.event.event_type, hit.event.title, status_label, truncated
            ));
        }
        Ok(lines.join("\n"))
    }

    pub fn titles_for_branch(&self, branch: &BranchId) -> Result<HashSet<String>> {
        let mut stmt = self
            .db
            .conn()
            .prepare("SELECT title FROM events WHERE branch_id = ?1")?;
        let titles = stmt
            .query_map([branch.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(titles)
    }

    pub fn title_map(&self, branch: &BranchId) -> Result<HashMap<String, (i64, EventStatus)>> {
        let mut stmt = self
            .db
            .conn()
            .prepare("SELECT id, title, status FROM events WHERE branch_id = ?1")?;
        let rows = stmt.query_map([branch.as_str()], |row| {
            let id: i64 = row.get(0)?;
            let title: String = row.get(1)?;
            let status: String = row.get(2)?;
            Ok((title, id, status))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (title, id, status) = row?;
            let status = parse_status(&status);
            map.insert(title, (id, status));
        }
        Ok(map)
    }

    pub fn active_foreshadowing(&self, branch: &BranchId) -> Result<Vec<Event>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT * FROM events WHERE branch_id = ?1 AND status = 'planted' ORDER BY id",
        )?;
        let rows = stmt
            .query_map([branch.as_str()], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn status_label(status: EventStatus) -> &'static str {
    match status {
        EventStatus::Planted => "已埋",
        EventStatus::Triggered => "已觸發",
        EventStatus::Resolved => "已解決",
        EventStatus::Abandoned => "已廢棄",
    }
}

fn parse_status(s: &str) -> EventStatus {
    match s {
        "triggered" => EventStatus::Triggered,
        "resolved" => EventStatus::Resolved,
        "abandoned" => EventStatus::Abandoned,
        _ => EventStatus::Planted,
    }
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    Ok(Event {
        id: row.get("id")?,
        event_type: row.get("event_type")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: parse_status(&status),
        tags: row.get("tags")?,
        related_titles: row.get("related_titles")?,
        message_index: row.get("message_index")?,
        branch_id: BranchId::new(row.get::<_, String>("branch_id")?),
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(branch: &str, title: &str, idx: Option<i64>) -> Event {
        Event {
            id: None,
            event_type: "遭遇".to_string(),
            title: title.to_string(),
            description: "一段描述內容".to_string(),
            status: EventStatus::Planted,
            tags: "副本".to_string(),
            related_titles: String::new(),
            message_index: idx,
            branch_id: BranchId::new(branch),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let index = EventIndex::open_in_memory().unwrap();
        let id = index.insert(&sample_event("main", "領取副本", Some(1))).unwrap();
        let fetched = index.get_by_id(id).unwrap().unwrap();
        assert_eq!(fetched.title, "領取副本");
        assert_eq!(fetched.status, EventStatus::Planted);
    }

    #[test]
    fn copy_for_fork_respects_branch_point_index() {
        let index = EventIndex::open_in_memory().unwrap();
        index.insert(&sample_event("main", "早期事件", Some(1))).unwrap();
        index.insert(&sample_event("main", "晚期事件", Some(10))).unwrap();
        index
            .copy_for_fork(&BranchId::new("main"), &BranchId::new("branch_1"), Some(5))
            .unwrap();
        let copied = index.get(Some(&BranchId::new("branch_1")), 50).unwrap();
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].title, "早期事件");
    }

    #[test]
    fn merge_into_inserts_new_and_overwrites_status_of_existing() {
        let index = EventIndex::open_in_memory().unwrap();
        let main = BranchId::new("main");
        let branch_1 = BranchId::new("branch_1");

        let shared_title = sample_event("main", "共用標題", None);
        let mut dst_copy = shared_title.clone();
        dst_copy.branch_id = branch_1.clone();
        index.insert(&dst_copy).unwrap();

        let mut src_resolved = shared_title;
        src_resolved.status = EventStatus::Resolved;
        index.insert(&src_resolved).unwrap();
        index.insert(&sample_event("main", "新標題", None)).unwrap();

        index.merge_into(&main, &branch_1).unwrap();

        let dst_events = index.get(Some(&branch_1), 50).unwrap();
        let titles: HashSet<_> = dst_events.iter().map(|e| e.title.clone()).collect();
        assert!(titles.contains("新標題"));
        let merged_shared = dst_events.iter().find(|e| e.title == "共用標題").unwrap();
        assert_eq!(merged_shared.status, EventStatus::Resolved);
    }

    #[test]
    fn search_scores_title_hits_above_description_hits() {
        let index = EventIndex::open_in_memory().unwrap();
        index.insert(&sample_event("main", "副本入口", None)).unwrap();
        let hits = index.search("副本", Some(&BranchId::new("main")), 5, false).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score >= 10);
    }
}
