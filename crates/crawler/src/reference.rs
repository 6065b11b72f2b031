use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use url::Url;

/// Canonical identifier of one content item: an absolute URL with the
/// fragment removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reference(String);

impl Reference {
    /// Resolve `href` against `origin`. Returns `None` for links that cannot
    /// be joined (e.g. malformed schemes).
    pub fn resolve(origin: &Url, href: &str) -> Option<Self> {
        let url = origin.join(href.trim()).ok()?;
        Some(Self::from(url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Url> for Reference {
    fn from(mut url: Url) -> Self {
        url.set_fragment(None);
        Self(url.into())
    }
}

impl From<&str> for Reference {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Reference {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for Reference {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Reference {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered, duplicate-free collection of references in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSet {
    items: IndexSet<Reference>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.items.contains(reference)
    }

    /// Returns `true` if the reference was not seen before.
    pub fn insert(&mut self, reference: Reference) -> bool {
        self.items.insert(reference)
    }

    /// Add every unseen reference and return how many were new.
    pub fn extend_new<I>(&mut self, references: I) -> usize
    where
        I: IntoIterator<Item = Reference>,
    {
        references
            .into_iter()
            .filter(|reference| self.items.insert(reference.clone()))
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reference> {
        self.items.iter()
    }
}

impl FromIterator<Reference> for ReferenceSet {
    fn from_iter<T: IntoIterator<Item = Reference>>(iter: T) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ReferenceSet {
    type Item = Reference;
    type IntoIter = indexmap::set::IntoIter<Reference>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a ReferenceSet {
    type Item = &'a Reference;
    type IntoIter = indexmap::set::Iter<'a, Reference>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Url {
        Url::parse("https://feed.example.com").unwrap()
    }

    #[test]
    fn test_resolve_relative_and_absolute_agree() {
        let relative = Reference::resolve(&origin(), "/p/abc/").unwrap();
        let absolute = Reference::resolve(&origin(), "https://feed.example.com/p/abc/").unwrap();
        let fragment = Reference::resolve(&origin(), "/p/abc/#comments").unwrap();
        assert_eq!(relative, absolute);
        assert_eq!(relative, fragment);
        assert_eq!(relative.as_str(), "https://feed.example.com/p/abc/");
    }

    #[test]
    fn test_extend_new_counts_only_unseen() {
        let mut set = ReferenceSet::new();
        assert_eq!(set.extend_new(["a".into(), "b".into()]), 2);
        assert_eq!(set.extend_new(["b".into(), "c".into(), "c".into()]), 1);

        let order: Vec<&str> = set.iter().map(Reference::as_str).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(set.contains("c"));
    }
}
