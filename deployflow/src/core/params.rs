//! Ordered parameter sets passed to stage actions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An ordered mapping from parameter name to string value.
///
/// Insertion order is preserved; inserting an existing name replaces its
/// value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    entries: Vec<(String, String)>,
}

impl ParameterSet {
    /// Creates an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter, builder style.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Inserts or replaces a parameter.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    /// Returns the value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overlays `other` on top of this set.
    ///
    /// Values in `other` win; new names are appended in `other`'s order.
    #[must_use]
    pub fn merged(mut self, other: &Self) -> Self {
        for (name, value) in other.iter() {
            self.insert(name, value);
        }
        self
    }

    /// Returns the names in `required` whose value is missing or blank.
    #[must_use]
    pub fn missing<'a>(&self, required: &'a [String]) -> Vec<&'a str> {
        required
            .iter()
            .filter(|name| self.get(name).map_or(true, |v| v.trim().is_empty()))
            .map(String::as_str)
            .collect()
    }

    /// Renders the set as `name=value` arguments.
    #[must_use]
    pub fn to_assignments(&self) -> Vec<String> {
        self.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Returns a stable SHA-256 fingerprint of the ordered entries.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in &self.entries {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_insert_preserves_order_and_replaces() {
        let mut params = ParameterSet::new().with("prefix", "alpha").with("location", "eastus");
        params.insert("prefix", "beta");

        let names: Vec<_> = params.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["prefix", "location"]);
        assert_eq!(params.get("prefix"), Some("beta"));
    }

    #[test]
    fn test_missing_treats_blank_as_missing() {
        let params = ParameterSet::new().with("clusterName", "  ").with("location", "eastus");
        let required = vec!["clusterName".to_string(), "location".to_string(), "rg".to_string()];
        assert_eq!(params.missing(&required), vec!["clusterName", "rg"]);
    }

    #[test]
    fn test_merged_overlays() {
        let base = ParameterSet::new().with("a", "1").with("b", "2");
        let overlay = ParameterSet::new().with("b", "3").with("c", "4");
        let merged = base.merged(&overlay);
        assert_eq!(merged.to_assignments(), vec!["a=1", "b=3", "c=4"]);
    }

    #[test]
    fn test_fingerprint_is_order_sensitive_and_stable() {
        let one = ParameterSet::new().with("a", "1").with("b", "2");
        let same = ParameterSet::new().with("a", "1").with("b", "2");
        let swapped = ParameterSet::new().with("b", "2").with("a", "1");

        assert_eq!(one.fingerprint(), same.fingerprint());
        assert_ne!(one.fingerprint(), swapped.fingerprint());
        assert_eq!(one.fingerprint().len(), 64);
    }

    #[test]
    fn test_serializes_as_pairs() {
        let params = ParameterSet::new().with("a", "1");
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"[["a","1"]]"#);
    }
}
