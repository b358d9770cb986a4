//! Timeline reconstruction, fork/sibling discovery, and the branch
//! lifecycle operations: create, create-blank, switch, rename, config,
//! promote, merge, delete.
//!
//! Recap and world-clock copying on fork/promote/merge belong to
//! `storyforge-runtime` (it owns the LLM-backed recap engine and the world
//! clock); callers there are expected to invoke those after the tree
//! mutations this module performs. This module only moves branch-native
//! data: messages, character state, NPCs, config and GM cheats.

use crate::cheats;
use crate::error::{EngineError, Result};
use crate::schema;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use storyforge_core::{read_json_opt, read_json_or_default, write_json_atomic, Workspace};
use storyforge_types::{
    Branch, BranchConfig, BranchId, BranchTree, CharacterState, Message, Npc, StoryId,
    BLANK_BRANCH_POINT,
};

/// Loads a story's branch tree, seeding a fresh one rooted at `main` the
/// first time a story is touched.
pub fn load_tree(ws: &Workspace, story: &StoryId) -> Result<BranchTree> {
    let path = ws.story(story).timeline_tree();
    match read_json_opt(&path)? {
        Some(tree) => Ok(tree),
        None => Ok(BranchTree::new(Branch::root(Utc::now()))),
    }
}

pub fn save_tree(ws: &Workspace, story: &StoryId, tree: &BranchTree) -> Result<()> {
    write_json_atomic(&ws.story(story).timeline_tree(), tree)?;
    Ok(())
}

fn load_messages(ws: &Workspace, story: &StoryId, branch: &BranchId) -> Result<Vec<Message>> {
    Ok(read_json_or_default(&ws.branch(story, branch).messages())?)
}

fn save_messages(
    ws: &Workspace,
    story: &StoryId,
    branch: &BranchId,
    messages: &[Message],
) -> Result<()> {
    write_json_atomic(&ws.branch(story, branch).messages(), &messages)?;
    Ok(())
}

fn load_config(ws: &Workspace, story: &StoryId, branch: &BranchId) -> Result<BranchConfig> {
    Ok(read_json_or_default(&ws.branch(story, branch).config())?)
}

fn save_config(ws: &Workspace, story: &StoryId, branch: &BranchId, config: &BranchConfig) -> Result<()> {
    write_json_atomic(&ws.branch(story, branch).config(), config)?;
    Ok(())
}

pub fn get_branch_config(ws: &Workspace, story: &StoryId, branch: &BranchId) -> Result<BranchConfig> {
    load_config(ws, story, branch)
}

/// Merges `patch` into the branch's stored config and persists it.
pub fn set_branch_config(
    ws: &Workspace,
    story: &StoryId,
    branch: &BranchId,
    patch: serde_json::Map<String, serde_json::Value>,
) -> Result<BranchConfig> {
    let mut config = load_config(ws, story, branch)?;
    config.merge(patch);
    save_config(ws, story, branch, &config)?;
    Ok(config)
}

/// Reconstructs a branch's full message timeline: the story's base
/// conversation (parsed at design time), truncated and extended once per
/// ancestor on the way down to `branch`. Stamps `owner_branch_id` on every
/// message, which is never itself persisted (read-time-only, §3).
pub fn full_timeline(ws: &Workspace, story: &StoryId, tree: &BranchTree, branch: &BranchId) -> Result<Vec<Message>> {
    let base_path = ws.story_design(story).parsed_conversation();
    let mut base: Vec<Message> = read_json_or_default(&base_path)?;

    let chain = tree.ancestor_chain(branch);
    let Some(root_owner) = chain.first() else {
        for m in &mut base {
            m.owner_branch_id = Some(BranchId::root());
        }
        return Ok(base);
    };
    for m in &mut base {
        m.owner_branch_id = Some(root_owner.id.clone());
    }

    let mut timeline = base;
    for ancestor in &chain {
        if let Some(bp) = ancestor.branch_point_index {
            timeline.retain(|m| m.index <= bp);
        }
        let mut delta = load_messages(ws, story, &ancestor.id)?;
        for m in &mut delta {
            m.owner_branch_id = Some(ancestor.id.clone());
        }
        timeline.extend(delta);
    }
    Ok(timeline)
}

/// Walks `branch`'s timeline backwards from `target_index` for the nearest
/// `state_snapshot`, falling back to the story's blank character state.
pub fn state_at_index(
    ws: &Workspace,
    story: &StoryId,
    tree: &BranchTree,
    branch: &BranchId,
    target_index: i64,
) -> Result<CharacterState> {
    let timeline = full_timeline(ws, story, tree, branch)?;
    for msg in timeline.iter().rev() {
        if msg.index > target_index {
            continue;
        }
        if let Some(snapshots) = &msg.snapshots {
            return Ok(snapshots.state_snapshot.clone());
        }
    }
    let default_path = ws.story_design(story).default_character_state();
    if let Some(state) = read_json_opt(&default_path)? {
        return Ok(state);
    }
    let schema = schema::load_schema(ws, story)?;
    Ok(schema::blank_character_state(&schema))
}

/// Walks `branch`'s timeline backwards from `target_index` for the nearest
/// `npcs_snapshot`, defaulting to an empty roster.
pub fn npcs_at_index(
    ws: &Workspace,
    story: &StoryId,
    tree: &BranchTree,
    branch: &BranchId,
    target_index: i64,
) -> Result<Vec<Npc>> {
    let timeline = full_timeline(ws, story, tree, branch)?;
    for msg in timeline.iter().rev() {
        if msg.index > target_index {
            continue;
        }
        if let Some(snapshots) = &msg.snapshots {
            return Ok(snapshots.npcs_snapshot.clone());
        }
    }
    Ok(Vec::new())
}

/// Redirects a would-be parent to its own parent when `branch_point_index`
/// falls at or before that parent's own fork point - turns what would be a
/// linear edit/regen chain into siblings sharing a grandparent.
pub fn resolve_sibling_parent(tree: &BranchTree, parent: &BranchId, branch_point_index: i64) -> BranchId {
    let mut current = parent.clone();
    loop {
        if current.is_root() {
            return current;
        }
        let Some(branch) = tree.get(&current) else {
            return current;
        };
        match branch.branch_point_index {
            Some(parent_bp) if branch_point_index <= parent_bp => {
                current = branch
                    .parent_branch_id
                    .clone()
                    .unwrap_or_else(BranchId::root);
            }
            _ => return current,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForkPoint {
    pub branch_id: BranchId,
    pub branch_name: String,
}

/// Message indices at which a branch other than `branch` diverges from an
/// ancestor of `branch`, keyed by `branch_point_index`. Used to surface
/// "this turn has siblings" markers in a timeline view.
pub fn fork_points(tree: &BranchTree, branch: &BranchId) -> HashMap<i64, Vec<ForkPoint>> {
    let ancestors: HashSet<BranchId> = tree.ancestor_ids(branch).into_iter().collect();
    let mut points: HashMap<i64, Vec<ForkPoint>> = HashMap::new();

    for other in tree.branches.values() {
        if &other.id == branch || other.deleted || other.blank || other.merged {
            continue;
        }
        let Some(parent) = &other.parent_branch_id else { continue };
        let Some(bp) = other.branch_point_index else { continue };
        if ancestors.contains(parent) {
            points.entry(bp).or_default().push(ForkPoint {
                branch_id: other.id.clone(),
                branch_name: other.name.clone(),
            });
        }
    }
    points
}

#[derive(Debug, Clone, PartialEq)]
pub struct SiblingVariant {
    pub branch_id: BranchId,
    pub label: String,
    pub is_current: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SiblingGroup {
    pub current_variant: usize,
    pub total: usize,
    pub variants: Vec<SiblingVariant>,
}

/// Groups of mutually-exclusive continuations sharing a `(parent, fork
/// point)` pair that lie on `branch`'s own ancestor path, keyed by the
/// divergent message index (`fork_point + 1`). A group only appears once it
/// has at least two variants.
pub fn sibling_groups(
    ws: &Workspace,
    story: &StoryId,
    tree: &BranchTree,
    branch: &BranchId,
) -> Result<HashMap<i64, SiblingGroup>> {
    if !tree.contains(branch) {
        return Ok(HashMap::new());
    }
    let ancestors: HashSet<BranchId> = tree.ancestor_ids(branch).into_iter().collect();

    let mut fork_map: HashMap<(BranchId, i64), Vec<&Branch>> = HashMap::new();
    for b in tree.branches.values() {
        if b.deleted || b.blank || b.merged {
            continue;
        }
        let (Some(parent), Some(bp)) = (&b.parent_branch_id, b.branch_point_index) else {
            continue;
        };
        if ancestors.contains(parent) {
            fork_map.entry((parent.clone(), bp)).or_default().push(b);
        }
    }

    let mut groups = HashMap::new();
    for ((parent_id, bp), mut children) in fork_map {
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let parent_delta = load_messages(ws, story, &parent_id)?;
        let mut parent_has_continuation = parent_delta.iter().any(|m| m.index > bp);
        if parent_id.is_root() && !parent_has_continuation {
            let parsed: Vec<Message> = read_json_or_default(&ws.story_design(story).parsed_conversation())?;
            parent_has_continuation = parsed.iter().any(|m| m.index > bp);
        }

        let mut variants = Vec::new();
        if parent_has_continuation {
            let any_child_is_ancestor = children.iter().any(|c| ancestors.contains(&c.id));
            let Some(parent_branch) = tree.get(&parent_id) else { continue };
            variants.push(SiblingVariant {
                branch_id: parent_id.clone(),
                label: parent_branch.name.clone(),
                is_current: ancestors.contains(&parent_id) && !any_child_is_ancestor,
            });
        }
        for child in &children {
            variants.push(SiblingVariant {
                branch_id: child.id.clone(),
                label: child.name.clone(),
                is_current: ancestors.contains(&child.id),
            });
        }

        if variants.len() >= 2 {
            let current_variant = variants
                .iter()
                .position(|v| v.is_current)
                .map(|i| i + 1)
                .unwrap_or(0);
            groups.insert(
                bp + 1,
                SiblingGroup {
                    current_variant,
                    total: variants.len(),
                    variants,
                },
            );
        }
    }
    Ok(groups)
}

/// Creates a new branch forking from `parent` at `branch_point_index`,
/// inheriting character state, NPCs and config as of that point. Resolves
/// sibling coalescing first (§4.11: repeated edit/regen at the same origin
/// produces siblings, not a linear chain).
pub fn create(
    ws: &Workspace,
    story: &StoryId,
    tree: &mut BranchTree,
    name: &str,
    parent: &BranchId,
    branch_point_index: i64,
) -> Result<Branch> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::NameRequired());
    }
    let parent = resolve_sibling_parent(tree, parent, branch_point_index);
    if !tree.contains(&parent) {
        return Err(EngineError::ParentNotFound(parent.as_str().to_string()));
    }

    let branch_id = BranchId::generate();
    let now = Utc::now();

    let forked_state = state_at_index(ws, story, tree, &parent, branch_point_index)?;
    write_json_atomic(&ws.branch(story, &branch_id).character_state(), &forked_state)?;
    let forked_npcs = npcs_at_index(ws, story, tree, &parent, branch_point_index)?;
    write_json_atomic(&ws.branch(story, &branch_id).npcs(), &forked_npcs)?;

    let parent_config = load_config(ws, story, &parent)?;
    save_config(ws, story, &branch_id, &parent_config)?;
    cheats::copy_cheats(ws, story, &parent, &branch_id)?;
    save_messages(ws, story, &branch_id, &[])?;

    let branch = Branch {
        id: branch_id.clone(),
        name: name.to_string(),
        parent_branch_id: Some(parent),
        branch_point_index: Some(branch_point_index),
        created_at: now,
        session_id: None,
        blank: false,
        deleted: false,
        deleted_at: None,
        was_main: false,
        merged: false,
        merged_at: None,
    };
    tree.insert(branch.clone());
    tree.active_branch_id = branch_id;
    Ok(branch)
}

/// Creates a fresh-start branch inheriting nothing from any parent: blank
/// character state, no NPCs, no messages. Config is still copied from
/// `main` so settings like `team_mode` carry over.
pub fn create_blank(ws: &Workspace, story: &StoryId, tree: &mut BranchTree, name: &str) -> Result<Branch> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::NameRequired());
    }

    let branch_id = BranchId::generate();
    let now = Utc::now();

    let schema = schema::load_schema(ws, story)?;
    let blank_state = schema::blank_character_state(&schema);
    write_json_atomic(&ws.branch(story, &branch_id).character_state(), &blank_state)?;
    write_json_atomic(&ws.branch(story, &branch_id).npcs(), &Vec::<Npc>::new())?;
    save_messages(ws, story, &branch_id, &[])?;

    let main_config = load_config(ws, story, &BranchId::root())?;
    save_config(ws, story, &branch_id, &main_config)?;

    let branch = Branch {
        id: branch_id.clone(),
        name: name.to_string(),
        parent_branch_id: Some(BranchId::root()),
        branch_point_index: Some(BLANK_BRANCH_POINT),
        created_at: now,
        session_id: None,
        blank: true,
        deleted: false,
        deleted_at: None,
        was_main: false,
        merged: false,
        merged_at: None,
    };
    tree.insert(branch.clone());
    tree.active_branch_id = branch_id;
    Ok(branch)
}

pub fn switch_active(tree: &mut BranchTree, branch: &BranchId) -> Result<()> {
    if !tree.contains(branch) {
        return Err(EngineError::BranchNotFound(branch.as_str().to_string()));
    }
    tree.active_branch_id = branch.clone();
    Ok(())
}

pub fn rename(tree: &mut BranchTree, branch: &BranchId, name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::NameRequired());
    }
    let b = tree
        .get_mut(branch)
        .ok_or_else(|| EngineError::BranchNotFound(branch.as_str().to_string()))?;
    b.name = name.to_string();
    Ok(())
}

/// Promotes `branch` to become the new root timeline: its full
/// reconstructed timeline (minus whatever `main` already held) becomes
/// `main`'s delta, character state and NPCs are copied onto `main`, and
/// every branch along the promoted ancestor chain is soft-deleted
/// (`was_main`) rather than removed, preserving history for anything still
/// forked off it.
pub fn promote(ws: &Workspace, story: &StoryId, tree: &mut BranchTree, branch: &BranchId) -> Result<()> {
    if branch.is_root() {
        return Err(EngineError::CannotTargetRoot());
    }
    if !tree.contains(branch) {
        return Err(EngineError::BranchNotFound(branch.as_str().to_string()));
    }

    let original: Vec<Message> = read_json_or_default(&ws.story_design(story).parsed_conversation())?;
    let original_count = original.len() as i64;

    let full = full_timeline(ws, story, tree, branch)?;
    let mut new_messages: Vec<Message> = full.into_iter().filter(|m| m.index >= original_count).collect();
    for m in &mut new_messages {
        m.clear_transient();
    }

    let mut ancestor_chain = Vec::new();
    let mut cur = Some(branch.clone());
    while let Some(id) = cur {
        if id.is_root() {
            break;
        }
        let next = tree.get(&id).and_then(|b| b.parent_branch_id.clone());
        ancestor_chain.push(id);
        cur = next;
    }

    save_messages(ws, story, &BranchId::root(), &new_messages)?;

    if let Some(src_char) = read_json_opt::<CharacterState>(&ws.branch(story, branch).character_state())? {
        write_json_atomic(&ws.branch(story, &BranchId::root()).character_state(), &src_char)?;
    }
    if let Some(src_npcs) = read_json_opt::<Vec<Npc>>(&ws.branch(story, branch).npcs())? {
        write_json_atomic(&ws.branch(story, &BranchId::root()).npcs(), &src_npcs)?;
    }

    let ancestor_set: HashSet<BranchId> = ancestor_chain.iter().cloned().collect();
    let reparent_targets: Vec<BranchId> = tree
        .branches
        .values()
        .filter(|b| {
            !b.id.is_root()
                && !ancestor_set.contains(&b.id)
                && b.parent_branch_id.as_ref().is_some_and(|p| ancestor_set.contains(p))
        })
        .map(|b| b.id.clone())
        .collect();
    for id in reparent_targets {
        if let Some(b) = tree.get_mut(&id) {
            b.parent_branch_id = Some(BranchId::root());
        }
    }

    let now = Utc::now();
    for id in &ancestor_chain {
        if let Some(b) = tree.get_mut(id) {
            b.deleted = true;
            b.deleted_at = Some(now);
            b.was_main = true;
        }
    }

    tree.active_branch_id = BranchId::root();
    Ok(())
}

/// Merges `branch` into its parent: the parent's messages at or before the
/// fork point are kept, then `branch`'s own delta is appended; character
/// state, NPCs and children are reparented onto the parent, and `branch`
/// itself is marked `merged` (not deleted - its content is now redundant
/// but its id stays resolvable).
pub fn merge(ws: &Workspace, story: &StoryId, tree: &mut BranchTree, branch: &BranchId) -> Result<BranchId> {
    if branch.is_root() {
        return Err(EngineError::CannotTargetRoot());
    }
    let child = tree
        .get(branch)
        .cloned()
        .ok_or_else(|| EngineError::BranchNotFound(branch.as_str().to_string()))?;
    if child.deleted {
        return Err(EngineError::BranchDeleted(branch.as_str().to_string()));
    }
    if child.merged {
        return Err(EngineError::AlreadyMerged(branch.as_str().to_string()));
    }
    let parent_id = child
        .parent_branch_id
        .clone()
        .ok_or_else(|| EngineError::NoParent(branch.as_str().to_string()))?;
    if !tree.contains(&parent_id) {
        return Err(EngineError::ParentNotFound(parent_id.as_str().to_string()));
    }

    let branch_point = child.branch_point_index.unwrap_or(-1);
    let parent_msgs = load_messages(ws, story, &parent_id)?;
    let mut kept: Vec<Message> = parent_msgs.into_iter().filter(|m| m.index <= branch_point).collect();

    let mut child_msgs = load_messages(ws, story, branch)?;
    for m in &mut child_msgs {
        m.clear_transient();
    }
    kept.extend(child_msgs);
    save_messages(ws, story, &parent_id, &kept)?;

    if let Some(src_char) = read_json_opt::<CharacterState>(&ws.branch(story, branch).character_state())? {
        write_json_atomic(&ws.branch(story, &parent_id).character_state(), &src_char)?;
    }
    if let Some(src_npcs) = read_json_opt::<Vec<Npc>>(&ws.branch(story, branch).npcs())? {
        write_json_atomic(&ws.branch(story, &parent_id).npcs(), &src_npcs)?;
    }

    let children_to_reparent: Vec<BranchId> = tree
        .branches
        .values()
        .filter(|b| b.parent_branch_id.as_ref() == Some(branch))
        .map(|b| b.id.clone())
        .collect();
    for id in children_to_reparent {
        if let Some(b) = tree.get_mut(&id) {
            b.parent_branch_id = Some(parent_id.clone());
        }
    }

    let now = Utc::now();
    if let Some(b) = tree.get_mut(branch) {
        b.merged = true;
        b.merged_at = Some(now);
    }

    if tree.active_branch_id == *branch {
        tree.active_branch_id = parent_id.clone();
    }
    Ok(parent_id)
}

/// Deletes `branch` and every non-deleted descendant (breadth-first).
/// Branches that were previously promoted-away roots (`was_main`) are
/// soft-deleted like on promotion, to preserve any history still reachable
/// through them; ordinary branches have their directory removed outright.
pub fn delete(ws: &Workspace, story: &StoryId, tree: &mut BranchTree, branch: &BranchId) -> Result<()> {
    if branch.is_root() {
        return Err(EngineError::CannotTargetRoot());
    }
    if !tree.contains(branch) {
        return Err(EngineError::BranchNotFound(branch.as_str().to_string()));
    }

    let mut to_delete = Vec::new();
    let mut queue = vec![branch.clone()];
    let mut seen: HashSet<BranchId> = HashSet::new();
    while let Some(id) = queue.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        to_delete.push(id.clone());
        for b in tree.branches.values() {
            if b.parent_branch_id.as_ref() == Some(&id) && !seen.contains(&b.id) && !b.deleted {
                queue.push(b.id.clone());
            }
        }
    }

    let now = Utc::now();
    for id in &to_delete {
        let was_main = tree.get(id).map(|b| b.was_main).unwrap_or(false);
        if was_main {
            if let Some(b) = tree.get_mut(id) {
                b.deleted = true;
                b.deleted_at = Some(now);
            }
        } else {
            let dir = ws.branch(story, id).dir().to_path_buf();
            if dir.is_dir() {
                let _ = std::fs::remove_dir_all(&dir);
            }
            tree.branches.remove(id.as_str());
        }
    }

    if to_delete.contains(&tree.active_branch_id) {
        tree.active_branch_id = BranchId::root();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge_types::{Message, StoryId};

    fn ws() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        (dir, ws)
    }

    fn seed_base_messages(ws: &Workspace, story: &StoryId, n: i64) {
        let msgs: Vec<Message> = (0..n).map(|i| Message::user(i, format!("msg-{i}"))).collect();
        write_json_atomic(&ws.story_design(story).parsed_conversation(), &msgs).unwrap();
    }

    #[test]
    fn full_timeline_of_root_with_no_fork_is_just_the_base() {
        let (_dir, ws) = ws();
        let story = StoryId::new("s1");
        seed_base_messages(&ws, &story, 3);
        let tree = load_tree(&ws, &story).unwrap();
        let timeline = full_timeline(&ws, &story, &tree, &BranchId::root()).unwrap();
        assert_eq!(timeline.len(), 3);
        assert!(timeline.iter().all(|m| m.owner_branch_id == Some(BranchId::root())));
    }

    #[test]
    fn create_forks_at_branch_point_and_inherits_state() {
        let (_dir, ws) = ws();
        let story = StoryId::new("s1");
        seed_base_messages(&ws, &story, 5);

        let mut state = CharacterState::new();
        state.set("hp", serde_json::json!(10));
        let mut base: Vec<Message> = (0..5).map(|i| Message::user(i, format!("m{i}"))).collect();
        let mut snapshot_msg = Message::gm(3, "gm turn");
        snapshot_msg.snapshots = Some(storyforge_types::Snapshots {
            state_snapshot: state.clone(),
            npcs_snapshot: vec![],
            world_day_snapshot: 1.0,
        });
        base[3] = snapshot_msg;
        write_json_atomic(&ws.story_design(&story).parsed_conversation(), &base).unwrap();

        let mut tree = load_tree(&ws, &story).unwrap();
        let branch = create(&ws, &story, &mut tree, "alt", &BranchId::root(), 3).unwrap();

        assert_eq!(branch.parent_branch_id, Some(BranchId::root()));
        assert_eq!(branch.branch_point_index, Some(3));
        assert_eq!(tree.active_branch_id, branch.id);

        let state: CharacterState =
            read_json_or_default(&ws.branch(&story, &branch.id).character_state()).unwrap();
        assert_eq!(state.get("hp"), Some(&serde_json::json!(10)));
    }

    #[test]
    fn create_with_blank_name_fails() {
        let (_dir, ws) = ws();
        let story = StoryId::new("s1");
        let mut tree = load_tree(&ws, &story).unwrap();
        let err = create(&ws, &story, &mut tree, "   ", &BranchId::root(), 0).unwrap_err();
        assert!(matches!(err, EngineError::NameRequired()));
    }

    #[test]
    fn resolve_sibling_parent_redirects_to_grandparent_on_repeated_fork_at_origin() {
        let (_dir, ws) = ws();
        let story = StoryId::new("s1");
        seed_base_messages(&ws, &story, 5);
        let mut tree = load_tree(&ws, &story).unwrap();

        let first = create(&ws, &story, &mut tree, "first", &BranchId::root(), 2).unwrap();
        // Forking `first` at or before its own branch point should redirect to main.
        let resolved = resolve_sibling_parent(&tree, &first.id, 2);
        assert_eq!(resolved, BranchId::root());
    }

    #[test]
    fn create_blank_has_no_inherited_messages_or_npcs() {
        let (_dir, ws) = ws();
        let story = StoryId::new("s1");
        let mut tree = load_tree(&ws, &story).unwrap();
        let branch = create_blank(&ws, &story, &mut tree, "fresh start").unwrap();
        assert!(branch.is_blank());
        assert_eq!(branch.branch_point_index, Some(BLANK_BRANCH_POINT));

        let npcs: Vec<Npc> = read_json_or_default(&ws.branch(&story, &branch.id).npcs()).unwrap();
        assert!(npcs.is_empty());
    }

    #[test]
    fn merge_appends_child_delta_after_truncated_parent() {
        let (_dir, ws) = ws();
        let story = StoryId::new("s1");
        seed_base_messages(&ws, &story, 3);
        let mut tree = load_tree(&ws, &story).unwrap();
        let branch = create(&ws, &story, &mut tree, "alt", &BranchId::root(), 1).unwrap();

        save_messages(&ws, &story, &branch.id, &[Message::gm(2, "child turn")]).unwrap();
        save_messages(&ws, &story, &BranchId::root(), &[Message::gm(2, "main's own continuation")]).unwrap();

        let parent_id = merge(&ws, &story, &mut tree, &branch.id).unwrap();
        assert_eq!(parent_id, BranchId::root());

        let merged_msgs = load_messages(&ws, &story, &BranchId::root()).unwrap();
        assert_eq!(merged_msgs.len(), 1);
        assert_eq!(merged_msgs[0].content, "child turn");

        assert!(tree.get(&branch.id).unwrap().merged);
    }

    #[test]
    fn merge_of_root_is_rejected() {
        let (_dir, ws) = ws();
        let story = StoryId::new("s1");
        let mut tree = load_tree(&ws, &story).unwrap();
        let err = merge(&ws, &story, &mut tree, &BranchId::root()).unwrap_err();
        assert!(matches!(err, EngineError::CannotTargetRoot()));
    }

    #[test]
    fn delete_cascades_to_descendants_and_resets_active_branch() {
        let (_dir, ws) = ws();
        let story = StoryId::new("s1");
        seed_base_messages(&ws, &story, 3);
        let mut tree = load_tree(&ws, &story).unwrap();
        let a = create(&ws, &story, &mut tree, "a", &BranchId::root(), 0).unwrap();
        let b = create(&ws, &story, &mut tree, "b", &a.id, 0).unwrap();
        tree.active_branch_id = b.id.clone();

        delete(&ws, &story, &mut tree, &a.id).unwrap();

        assert!(!tree.contains(&a.id));
        assert!(!tree.contains(&b.id));
        assert_eq!(tree.active_branch_id, BranchId::root());
    }

    #[test]
    fn delete_root_is_rejected() {
        let (_dir, ws) = ws();
        let story = StoryId::new("s1");
        let mut tree = load_tree(&ws, &story).unwrap();
        let err = delete(&ws, &story, &mut tree, &BranchId::root()).unwrap_err();
        assert!(matches!(err, EngineError::CannotTargetRoot()));
    }

    #[test]
    fn sibling_groups_surface_once_two_variants_exist() {
        let (_dir, ws) = ws();
        let story = StoryId::new("s1");
        seed_base_messages(&ws, &story, 5);
        let mut tree = load_tree(&ws, &story).unwrap();

        // main keeps going past the fork point...
        save_messages(&ws, &story, &BranchId::root(), &[Message::gm(5, "main continues")]).unwrap();
        let alt = create(&ws, &story, &mut tree, "alt", &BranchId::root(), 4).unwrap();

        let groups = sibling_groups(&ws, &story, &tree, &alt.id).unwrap();
        let group = groups.get(&5).expect("divergent index 5 should have a sibling group");
        assert_eq!(group.total, 2);
        assert!(group.variants.iter().any(|v| v.branch_id == alt.id && v.is_current));
    }

    #[test]
    fn branch_config_merges_rather_than_replaces() {
        let (_dir, ws) = ws();
        let story = StoryId::new("s1");
        let branch = BranchId::root();

        set_branch_config(
            &ws,
            &story,
            &branch,
            serde_json::json!({"team_mode": "fixed_team"}).as_object().unwrap().clone(),
        )
        .unwrap();
        set_branch_config(
            &ws,
            &story,
            &branch,
            serde_json::json!({"difficulty": "hard"}).as_object().unwrap().clone(),
        )
        .unwrap();

        let config = get_branch_config(&ws, &story, &branch).unwrap();
        assert_eq!(config.team_mode(), "fixed_team");
        assert_eq!(config.0.get("difficulty"), Some(&serde_json::json!("hard")));
    }
}
