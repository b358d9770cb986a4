use std::fmt;

/// Opaque story identifier. Stories own a filesystem subtree; ids are
/// assigned by the caller (slugified name, uuid, whatever the embedder
/// wants) and never interpreted by the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct StoryId(pub String);

impl StoryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StoryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StoryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Branch identifier. `"main"` is reserved for the root branch
/// ([`crate::ROOT_BRANCH_ID`]); every other branch id is generated as
/// `branch_<8 hex chars>` by the branch engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct BranchId(pub String);

impl BranchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn root() -> Self {
        Self(crate::ROOT_BRANCH_ID.to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == crate::ROOT_BRANCH_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generates a new random branch id of the form `branch_<8 hex chars>`,
    /// matching the original's `f"branch_{uuid.uuid4().hex[:8]}"`.
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("branch_{}", &hex[..8]))
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BranchId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BranchId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
