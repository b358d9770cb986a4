use std::collections::HashSet;

/// Splits `query` into CJK bigrams and trigrams for substring search, since
/// CJK text has no whitespace word boundaries. Falls back to the whole
/// query when it contains no CJK runs (e.g. a pure-latin search term).
/// Shared by the lore, event and state indexes (`lore_db.search_lore`,
/// `event_db.search_events`, `state_db.search_state` all do this the same
/// way).
pub fn extract_keywords(query: &str) -> HashSet<String> {
    let mut keywords = HashSet::new();
    for run in cjk_runs(query) {
        let chars: Vec<char> = run.chars().collect();
        for window in chars.windows(2) {
            keywords.insert(window.iter().collect());
        }
        for window in chars.windows(3) {
            keywords.insert(window.iter().collect());
        }
    }
    if keywords.is_empty() && !query.is_empty() {
        keywords.insert(query.to_string());
    }
    keywords
}

fn cjk_runs(text: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if is_cjk(ch) {
            current.push(ch);
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

fn is_cjk(ch: char) -> bool {
    let c = ch as u32;
    (0x4e00..=0x9fff).contains(&c)
}

/// Scores one candidate record against a keyword set: `10` per keyword
/// found in `topic`, `5` per keyword found in `tags`, `1` per keyword
/// found in `content`. A keyword can contribute to all three buckets at
/// once if it appears in each field.
pub fn score(keywords: &HashSet<String>, topic: &str, tags: &str, content: &str) -> i64 {
    let mut total = 0i64;
    for kw in keywords {
        if topic.contains(kw.as_str()) {
            total += 10;
        }
        if tags.contains(kw.as_str()) {
            total += 5;
        }
        if content.contains(kw.as_str()) {
            total += 1;
        }
    }
    total
}

/// Extracts `[tag: a/b/c]` markers from free text into a flat, deduplicated
/// tag list, preserving first-seen order (`lore_db.extract_tags`).
pub fn extract_bracket_tags(content: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut seen = HashSet::new();
    let mut rest = content;
    while let Some(start) = rest.find("[tag:") {
        let after = &rest[start + "[tag:".len()..];
        let Some(end) = after.find(']') else {
            break;
        };
        for part in after[..end].split('/') {
            let t = part.trim().to_string();
            if !t.is_empty() && seen.insert(t.clone()) {
                tags.push(t);
            }
        }
        rest = &after[end + 1..];
    }
    tags
}

/// Strips inline `[tag: ...]` / `[source: ...]` markers from content meant
/// for display, since they're already indexed in the tags column
/// (`lore_db._INLINE_META_RE`).
pub fn strip_inline_meta(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    loop {
        let Some(start) = find_inline_meta_start(rest) else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..start]);
        let after = &rest[start..];
        match after.find(']') {
            Some(end) => rest = &after[end + 1..],
            None => {
                out.push_str(after);
                break;
            }
        }
    }
    out.trim().to_string()
}

fn find_inline_meta_start(text: &str) -> Option<usize> {
    let tag_pos = text.find("[tag:");
    let source_pos = text.find("[source:");
    match (tag_pos, source_pos) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bigrams_and_trigrams_from_cjk_run() {
        let keywords = extract_keywords("副本世界");
        assert!(keywords.contains("副本"));
        assert!(keywords.contains("本世"));
        assert!(keywords.contains("世界"));
        assert!(keywords.contains("副本世"));
    }

    #[test]
    fn scores_topic_higher_than_tag_higher_than_content() {
        let mut keywords = HashSet::new();
        keywords.insert("副本".to_string());
        let topic_hit = score(&keywords, "副本入口", "", "");
        let tag_hit = score(&keywords, "", "副本", "");
        let content_hit = score(&keywords, "", "", "副本深處");
        assert_eq!(topic_hit, 10);
        assert_eq!(tag_hit, 5);
        assert_eq!(content_hit, 1);
    }

    #[test]
    fn bracket_tags_split_on_slash_and_dedupe() {
        let tags = extract_bracket_tags("開場 [tag: 副本/入口] 描述 [tag: 入口]");
        assert_eq!(tags, vec!["副本".to_string(), "入口".to_string()]);
    }

    #[test]
    fn strip_inline_meta_removes_tag_and_source_markers() {
        let stripped = strip_inline_meta("正文內容 [tag: 副本] 其餘 [source: 設定集]");
        assert_eq!(stripped, "正文內容 其餘");
    }
}
