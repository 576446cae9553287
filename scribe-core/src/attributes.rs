//! Opaque formatting attributes attached to text spans.
//!
//! Attribute values are never interpreted. On inserted text and stored
//! content every value is `Some`; on a retain, `None` means "remove this
//! attribute from the retained span".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, Option<String>>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), Some(value.into()));
        self
    }

    /// Builder-style removal marker (only meaningful on retains).
    pub fn without(mut self, key: impl Into<String>) -> Self {
        self.0.insert(key.into(), None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Value of `key`, `None` when unset or marked for removal.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_deref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Drop removal markers, leaving only concrete values.
    pub fn normalized(&self) -> Attributes {
        Attributes(
            self.0
                .iter()
                .filter(|(_, v)| v.is_some())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub(crate) fn has_removals(&self) -> bool {
        self.0.values().any(Option::is_none)
    }

    /// Layer `later` over `self`.
    ///
    /// With `keep_removals`, removal markers from `later` survive so the
    /// result can still be applied to a retained span; without it they
    /// delete the key outright.
    pub fn compose(&self, later: &Attributes, keep_removals: bool) -> Attributes {
        let mut merged = self.0.clone();
        for (key, value) in &later.0 {
            match value {
                Some(_) => {
                    merged.insert(key.clone(), value.clone());
                }
                None if keep_removals => {
                    merged.insert(key.clone(), None);
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Attributes(merged)
    }

    /// Attributes of `self` that still need applying after `winner` has
    /// touched the same span: keys the winner set are dropped.
    pub fn yield_to(&self, winner: &Attributes) -> Attributes {
        Attributes(
            self.0
                .iter()
                .filter(|(k, _)| !winner.0.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Attributes(
            iter.into_iter()
                .map(|(k, v)| (k.into(), Some(v.into())))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_overrides_and_removes() {
        let base = Attributes::new().with("bold", "true").with("color", "red");
        let later = Attributes::new().with("color", "blue").without("bold");

        let kept = base.compose(&later, true);
        assert_eq!(kept.get("color"), Some("blue"));
        assert!(kept.contains_key("bold"));
        assert_eq!(kept.get("bold"), None);

        let applied = base.compose(&later, false);
        assert_eq!(applied.get("color"), Some("blue"));
        assert!(!applied.contains_key("bold"));
        assert_eq!(applied.len(), 1);
    }

    #[test]
    fn test_yield_to_drops_contested_keys() {
        let loser = Attributes::new().with("bold", "true").with("italic", "true");
        let winner = Attributes::new().without("bold");

        let rest = loser.yield_to(&winner);
        assert!(!rest.contains_key("bold"));
        assert_eq!(rest.get("italic"), Some("true"));
    }

    #[test]
    fn test_normalized_strips_removals() {
        let attrs = Attributes::new().with("heading", "1").without("bold");
        assert!(attrs.has_removals());
        let normal = attrs.normalized();
        assert!(!normal.has_removals());
        assert_eq!(normal.len(), 1);
    }

    #[test]
    fn test_json_shape() {
        let attrs = Attributes::new().with("bold", "true").without("italic");
        let json = serde_json::to_string(&attrs).unwrap();
        assert_eq!(json, r#"{"bold":"true","italic":null}"#);
        let back: Attributes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, attrs);
    }
}
