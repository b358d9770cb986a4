//! NPC roster load/save and the merge-by-name upsert the parser's NPC tag
//! family feeds into (§3, §4.7). The roster is canonical JSON truth per
//! branch, mirroring how character state works - `storyforge-index`'s state
//! index only mirrors this file for search, it never owns it.

use storyforge_core::{storage, Workspace};
use storyforge_types::{BranchId, Npc, StoryId};
use unicode_normalization::UnicodeNormalization;

use crate::Result;

/// Collapses case, punctuation and Unicode compatibility variants so NPC
/// identity matches regardless of how a model happens to render a name
/// (§3: "Identity is by name, case- and punctuation-insensitive,
/// NFKC-normalized"). This is stricter than the original's plain `==`
/// comparison on the raw `name` field; see DESIGN.md.
pub fn normalize_name(name: &str) -> String {
    name.nfkc()
        .collect::<String>()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

pub fn load_npcs(ws: &Workspace, story: &StoryId, branch: &BranchId) -> Result<Vec<Npc>> {
    let path = ws.branch(story, branch).npcs();
    Ok(storage::read_json_or_default(&path)?)
}

pub fn save_npcs(ws: &Workspace, story: &StoryId, branch: &BranchId, npcs: &[Npc]) -> Result<()> {
    let path = ws.branch(story, branch).npcs();
    storage::write_json_atomic(&path, &npcs.to_vec())?;
    Ok(())
}

/// Copies the NPC roster verbatim from one branch to another, used when a
/// branch forks (§4.1's `_copy_npcs_to_branch`).
pub fn copy_npcs_to_branch(
    ws: &Workspace,
    story: &StoryId,
    from: &BranchId,
    to: &BranchId,
) -> Result<()> {
    let npcs = load_npcs(ws, story, from)?;
    save_npcs(ws, story, to, &npcs)
}

/// Saves or updates a single NPC, matched by normalized name. An update
/// merges onto the existing record field-by-field (new values win, fields
/// the update omits survive); a brand-new name is appended with a
/// generated id. Does nothing if `npc.name` is blank.
pub fn upsert_npc(ws: &Workspace, story: &StoryId, branch: &BranchId, mut npc: Npc) -> Result<()> {
    let name = npc.name.trim().to_string();
    if name.is_empty() {
        return Ok(());
    }
    npc.name = name.clone();

    let mut npcs = load_npcs(ws, story, branch)?;
    let key = normalize_name(&name);

    if npc.id.is_none() {
        npc.id = Some(generate_npc_id(&name));
    }

    if let Some(existing) = npcs.iter_mut().find(|e| normalize_name(&e.name) == key) {
        merge_npc(existing, npc);
    } else {
        npcs.push(npc);
    }

    save_npcs(ws, story, branch, &npcs)
}

/// `"npc_" + name with non-word characters stripped, truncated to 20
/// chars`, matching the original's `"npc_" + re.sub(r'\W+', '', name)[:20]`.
fn generate_npc_id(name: &str) -> String {
    let cleaned: String = name.chars().filter(|c| c.is_alphanumeric()).collect();
    let truncated: String = cleaned.chars().take(20).collect();
    format!("npc_{truncated}")
}

/// Field-by-field merge: anything present in `update` overwrites `base`,
/// everything else is left alone. `update`'s `extra` map is merged key by
/// key rather than replacing `base.extra` wholesale, so a partial tag
/// payload never clobbers fields it didn't mention.
fn merge_npc(base: &mut Npc, update: Npc) {
    let Npc {
        id,
        name,
        role,
        appearance,
        personality,
        backstory,
        current_status,
        notable_traits,
        relationship_to_player,
        tier,
        lifecycle_status,
        archived_reason,
        extra,
    } = update;

    if id.is_some() {
        base.id = id;
    }
    base.name = name;
    if !role.is_empty() {
        base.role = role;
    }
    if !appearance.is_empty() {
        base.appearance = appearance;
    }
    if personality != Default::default() {
        base.personality = personality;
    }
    if !backstory.is_empty() {
        base.backstory = backstory;
    }
    if !current_status.is_empty() {
        base.current_status = current_status;
    }
    if !notable_traits.is_empty() {
        base.notable_traits = notable_traits;
    }
    if relationship_to_player != Default::default() {
        base.relationship_to_player = relationship_to_player;
    }
    if tier.is_some() {
        base.tier = tier;
    }
    base.lifecycle_status = lifecycle_status;
    if archived_reason.is_some() {
        base.archived_reason = archived_reason;
    }
    for (k, v) in extra {
        base.extra.insert(k, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge_core::Workspace;
    use tempfile::tempdir;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        (dir, ws)
    }

    #[test]
    fn normalize_name_folds_case_punctuation_and_width() {
        assert_eq!(normalize_name("Dr. Elena!"), normalize_name("dr elena"));
        assert_eq!(normalize_name("Ａｌｉｃｅ"), normalize_name("Alice"));
    }

    #[test]
    fn upsert_creates_new_npc_with_generated_id() {
        let (_dir, ws) = workspace();
        let story = StoryId::new("story1");
        let branch = BranchId::root();

        let npc = Npc {
            name: "艾琳娜·月影".to_string(),
            role: "守衛隊長".to_string(),
            ..Default::default()
        };
        upsert_npc(&ws, &story, &branch, npc).unwrap();

        let npcs = load_npcs(&ws, &story, &branch).unwrap();
        assert_eq!(npcs.len(), 1);
        assert!(npcs[0].id.as_deref().unwrap().starts_with("npc_"));
        assert_eq!(npcs[0].role, "守衛隊長");
    }

    #[test]
    fn upsert_merges_onto_existing_by_normalized_name() {
        let (_dir, ws) = workspace();
        let story = StoryId::new("story1");
        let branch = BranchId::root();

        upsert_npc(
            &ws,
            &story,
            &branch,
            Npc {
                name: "Elena".to_string(),
                role: "Guard".to_string(),
                backstory: "Grew up in the capital.".to_string(),
                ..Default::default()
            },
        )
        .unwrap();

        upsert_npc(
            &ws,
            &story,
            &branch,
            Npc {
                name: "ELENA!".to_string(),
                current_status: "Wounded in the last skirmish.".to_string(),
                ..Default::default()
            },
        )
        .unwrap();

        let npcs = load_npcs(&ws, &story, &branch).unwrap();
        assert_eq!(npcs.len(), 1);
        assert_eq!(npcs[0].role, "Guard");
        assert_eq!(npcs[0].backstory, "Grew up in the capital.");
        assert_eq!(npcs[0].current_status, "Wounded in the last skirmish.");
    }

    #[test]
    fn upsert_ignores_blank_name() {
        let (_dir, ws) = workspace();
        let story = StoryId::new("story1");
        let branch = BranchId::root();

        upsert_npc(
            &ws,
            &story,
            &branch,
            Npc {
                name: "   ".to_string(),
                ..Default::default()
            },
        )
        .unwrap();

        assert!(load_npcs(&ws, &story, &branch).unwrap().is_empty());
    }

    #[test]
    fn copy_npcs_to_branch_duplicates_roster() {
        let (_dir, ws) = workspace();
        let story = StoryId::new("story1");
        let main = BranchId::root();
        let fork = BranchId::new("fork1");

        upsert_npc(
            &ws,
            &story,
            &main,
            Npc {
                name: "Bramble".to_string(),
                ..Default::default()
            },
        )
        .unwrap();

        copy_npcs_to_branch(&ws, &story, &main, &fork).unwrap();
        let npcs = load_npcs(&ws, &story, &fork).unwrap();
        assert_eq!(npcs.len(), 1);
        assert_eq!(npcs[0].name, "Bramble");
    }
}
