//! Cross-story registry (`data/stories.json`, §6) and design-time
//! scaffolding for a story that hasn't been authored yet. Branch-tree
//! state lives under `storyforge-engine`; this module only owns the list
//! of known stories and which one is active.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use storyforge_core::{read_json_or_default, write_json_atomic, Workspace};
use storyforge_engine::{branch_tree, schema};
use storyforge_types::{Message, StoryId};

use crate::error::{Result, SdkError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryRecord {
    pub id: StoryId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Number of messages in the story's design-time `parsed_conversation`.
    /// New stories created through the API start at zero; imported ones
    /// carry whatever the import produced.
    #[serde(default)]
    pub original_count: i64,
    #[serde(default)]
    pub has_summary: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoriesRegistry {
    #[serde(default)]
    pub active_story_id: Option<StoryId>,
    #[serde(default)]
    pub stories: Vec<StoryRecord>,
}

fn load(ws: &Workspace) -> Result<StoriesRegistry> {
    Ok(read_json_or_default(&ws.stories_registry())?)
}

fn save(ws: &Workspace, registry: &StoriesRegistry) -> Result<()> {
    write_json_atomic(&ws.stories_registry(), registry)?;
    Ok(())
}

pub fn list(ws: &Workspace) -> Result<Vec<StoryRecord>> {
    Ok(load(ws)?.stories)
}

pub fn active_story_id(ws: &Workspace) -> Result<Option<StoryId>> {
    Ok(load(ws)?.active_story_id)
}

fn find<'a>(registry: &'a StoriesRegistry, id: &StoryId) -> Option<&'a StoryRecord> {
    registry.stories.iter().find(|s| &s.id == id)
}

/// Scaffolds a brand-new story's design-time files: a generic system
/// prompt, the default character schema/state, an empty base conversation
/// and empty world lore. Does nothing to files that already exist, so
/// re-running `create` against an already-authored story id is a no-op
/// beyond the registry entry.
pub fn create(ws: &Workspace, id: &StoryId, name: &str) -> Result<StoryRecord> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SdkError::StoryNameRequired);
    }

    let design = ws.story_design(id);
    if !design.system_prompt().exists() {
        std::fs::create_dir_all(design.dir()).map_err(|source| storyforge_core::CoreError::Io {
            path: design.dir().to_path_buf(),
            source,
        })?;
        std::fs::write(design.system_prompt(), DEFAULT_SYSTEM_PROMPT).map_err(|source| storyforge_core::CoreError::Io {
            path: design.system_prompt(),
            source,
        })?;
        let default_schema = schema::default_schema();
        write_json_atomic(&design.character_schema(), &default_schema)?;
        write_json_atomic(&design.default_character_state(), &schema::blank_character_state(&default_schema))?;
        write_json_atomic(&design.parsed_conversation(), &Vec::<Message>::new())?;
        write_json_atomic(&design.base_world_lore(), &Vec::<storyforge_types::LoreEntry>::new())?;
    }

    let tree = branch_tree::load_tree(ws, id)?;
    branch_tree::save_tree(ws, id, &tree)?;

    let original_count = {
        let parsed: Vec<Message> = read_json_or_default(&design.parsed_conversation())?;
        parsed.len() as i64
    };

    let record = StoryRecord {
        id: id.clone(),
        name: name.to_string(),
        created_at: Utc::now(),
        original_count,
        has_summary: false,
    };

    let mut registry = load(ws)?;
    if find(&registry, id).is_some() {
        registry.stories.retain(|s| &s.id != id);
    }
    registry.stories.push(record.clone());
    if registry.active_story_id.is_none() {
        registry.active_story_id = Some(id.clone());
    }
    save(ws, &registry)?;
    Ok(record)
}

pub fn rename(ws: &Workspace, id: &StoryId, name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SdkError::StoryNameRequired);
    }
    let mut registry = load(ws)?;
    let record = registry
        .stories
        .iter_mut()
        .find(|s| &s.id == id)
        .ok_or_else(|| SdkError::StoryNotFound(id.as_str().to_string()))?;
    record.name = name.to_string();
    save(ws, &registry)
}

pub fn switch(ws: &Workspace, id: &StoryId) -> Result<()> {
    let mut registry = load(ws)?;
    if find(&registry, id).is_none() {
        return Err(SdkError::StoryNotFound(id.as_str().to_string()));
    }
    registry.active_story_id = Some(id.clone());
    save(ws, &registry)
}

/// Removes a story's registry entry and its whole `data/stories/<id>`
/// tree. Design-time files under `story_design/<id>` are left alone - they
/// may have been authored by hand and are cheap to keep around.
pub fn delete(ws: &Workspace, id: &StoryId) -> Result<()> {
    let mut registry = load(ws)?;
    if find(&registry, id).is_none() {
        return Err(SdkError::StoryNotFound(id.as_str().to_string()));
    }
    registry.stories.retain(|s| &s.id != id);
    if registry.active_story_id.as_ref() == Some(id) {
        registry.active_story_id = registry.stories.first().map(|s| s.id.clone());
    }
    save(ws, &registry)?;

    let dir = ws.story(id).dir().to_path_buf();
    if dir.is_dir() {
        let _ = std::fs::remove_dir_all(&dir);
    }
    Ok(())
}

pub fn get(ws: &Workspace, id: &StoryId) -> Result<StoryRecord> {
    load(ws)?
        .stories
        .into_iter()
        .find(|s| &s.id == id)
        .ok_or_else(|| SdkError::StoryNotFound(id.as_str().to_string()))
}

const DEFAULT_SYSTEM_PROMPT: &str = "你是這場互動式角色扮演遊戲的主神 (Game Master)。請根據玩家的行動描述故事發展，\n並在需要時使用 STATE/LORE/NPC/EVENT/TIME 標籤回報狀態變化。\n";

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_scaffolds_design_files_and_registers_the_story() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let id = StoryId::new("story_original");

        let record = create(&ws, &id, "原創故事").unwrap();
        assert_eq!(record.name, "原創故事");
        assert_eq!(record.original_count, 0);

        assert!(ws.story_design(&id).system_prompt().exists());
        assert!(ws.story_design(&id).character_schema().exists());

        let stories = list(&ws).unwrap();
        assert_eq!(stories.len(), 1);
        assert_eq!(active_story_id(&ws).unwrap(), Some(id));
    }

    #[test]
    fn rename_and_delete_round_trip() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let id = StoryId::new("story_original");
        create(&ws, &id, "原創故事").unwrap();

        rename(&ws, &id, "新名字").unwrap();
        assert_eq!(get(&ws, &id).unwrap().name, "新名字");

        delete(&ws, &id).unwrap();
        assert!(list(&ws).unwrap().is_empty());
        assert!(get(&ws, &id).is_err());
    }

    #[test]
    fn switching_to_an_unknown_story_is_an_error() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let err = switch(&ws, &StoryId::new("nope")).unwrap_err();
        assert!(matches!(err, SdkError::StoryNotFound(_)));
    }
}
