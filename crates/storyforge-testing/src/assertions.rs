//! Small assertion helpers for the shapes `storyforge-sdk` returns, kept
//! here rather than duplicated across integration tests.

use anyhow::{Context, Result};
use storyforge_sdk::MessagesPage;
use storyforge_types::Role;

/// Asserts `page` has exactly `expected` messages and returns them, so a
/// caller can chain further checks without re-unwrapping.
pub fn assert_message_count(page: &MessagesPage, expected: usize) -> Result<()> {
    if page.messages.len() != expected {
        anyhow::bail!("expected {} messages, got {}", expected, page.messages.len());
    }
    Ok(())
}

/// Asserts the last message in `page` is a GM reply and returns its text.
pub fn assert_last_message_is_gm(page: &MessagesPage) -> Result<&str> {
    let last = page.messages.last().context("page has no messages")?;
    if last.role != Role::Gm {
        anyhow::bail!("expected last message to be from the GM, got {:?}", last.role);
    }
    Ok(&last.content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge_types::{BranchId, Message};

    #[test]
    fn counts_and_checks_last_role() {
        let messages = vec![Message::user(0, "走"), Message::gm(1, "好")];
        let page = MessagesPage {
            total: messages.len(),
            messages,
            offset: 0,
            original_count: 0,
            world_day: 1.0,
            fork_points: Default::default(),
            sibling_groups: Default::default(),
            branch_id: BranchId::root(),
        };
        assert_message_count(&page, 2).unwrap();
        assert_eq!(assert_last_message_is_gm(&page).unwrap(), "好");
    }
}
