use std::collections::HashMap;
use std::sync::Arc;

use memdex_error::{MemdexError, Result};
use smallvec::SmallVec;

/// A resolved json path: the tag of each step from the document root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TagsPath(SmallVec<[u32; 4]>);

impl TagsPath {
    #[must_use]
    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u32>> for TagsPath {
    fn from(v: Vec<u32>) -> Self {
        Self(v.into_iter().collect())
    }
}

#[derive(Debug, Default, Clone)]
struct TagsMatcherInner {
    names: Vec<String>,
    tags: HashMap<String, u32>,
    version: u32,
    state_token: u32,
}

/// Bidirectional map between JSON tag names and compact integer tags.
///
/// Cheap to clone: readers snapshot the inner state. Mutation happens under
/// the owning namespace's write lock and bumps the version so observers can
/// republish their view.
#[derive(Debug, Clone, Default)]
pub struct TagsMatcher {
    inner: Arc<TagsMatcherInner>,
}

impl TagsMatcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TagsMatcherInner {
                names: Vec::new(),
                tags: HashMap::new(),
                version: 0,
                state_token: 0x2231,
            }),
        }
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.inner.version
    }

    /// Token identifying this dictionary lineage; replication uses it to
    /// detect master/slave divergence.
    #[must_use]
    pub fn state_token(&self) -> u32 {
        self.inner.state_token
    }

    #[must_use]
    pub fn tag2name(&self, tag: u32) -> Option<&str> {
        self.inner.names.get(tag as usize).map(String::as_str)
    }

    #[must_use]
    pub fn name2tag(&self, name: &str) -> Option<u32> {
        self.inner.tags.get(name).copied()
    }

    /// Resolve a dotted json path. Empty result means some step is unknown.
    #[must_use]
    pub fn path2tag(&self, path: &str) -> TagsPath {
        let mut tags = SmallVec::new();
        for step in path.split('.') {
            match self.name2tag(step) {
                Some(tag) => tags.push(tag),
                None => return TagsPath::default(),
            }
        }
        TagsPath(tags)
    }

    /// Resolve or allocate the tag for a name.
    pub fn name2tag_or_add(&mut self, name: &str) -> u32 {
        if let Some(tag) = self.name2tag(name) {
            return tag;
        }
        let inner = Arc::make_mut(&mut self.inner);
        let tag = inner.names.len() as u32;
        inner.names.push(name.to_owned());
        inner.tags.insert(name.to_owned(), tag);
        inner.version += 1;
        tag
    }

    /// Resolve or allocate every step of a dotted path.
    pub fn path2tag_or_add(&mut self, path: &str) -> TagsPath {
        let mut tags = SmallVec::new();
        for step in path.split('.') {
            tags.push(self.name2tag_or_add(step));
        }
        TagsPath(tags)
    }

    /// Merge another dictionary into this one.
    ///
    /// Names already present keep their tags; the merge fails with
    /// `conflict` when the other dictionary assigned a different tag to a
    /// shared name under the same state token (the caller then re-serializes
    /// the item through a JSON round-trip).
    pub fn merge(&mut self, other: &TagsMatcher) -> Result<()> {
        let same_lineage = self.state_token() == other.state_token();
        for (tag, name) in other.inner.names.iter().enumerate() {
            match self.name2tag(name) {
                Some(existing) => {
                    if same_lineage && existing != tag as u32 {
                        return Err(MemdexError::conflict(format!(
                            "tagsmatcher merge: tag for '{name}' diverged ({existing} != {tag})"
                        )));
                    }
                }
                None => {
                    self.name2tag_or_add(name);
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.names.is_empty()
    }
}
