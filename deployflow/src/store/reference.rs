//! `${stage.key}` output references.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"\$\{\s*([A-Za-z0-9_-]+)\.([A-Za-z0-9_-]+)(\?)?\s*\}").unwrap()
    })
}

/// A reference from a parameter value to another stage's output.
///
/// Written `${stage.key}`; `${stage.key?}` marks the reference optional,
/// resolving to an empty string when the output is absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// The producing stage.
    pub stage: String,
    /// The output key.
    pub key: String,
    /// Whether absence resolves to an empty string.
    pub optional: bool,
}

impl Reference {
    /// Creates a required reference.
    #[must_use]
    pub fn new(stage: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            key: key.into(),
            optional: false,
        }
    }

    /// Creates an optional reference.
    #[must_use]
    pub fn optional(stage: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            optional: true,
            ..Self::new(stage, key)
        }
    }

    /// Parses a single reference such as `${infra.clusterName}`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let caps = reference_pattern().captures(text.trim())?;
        let whole = caps.get(0)?;
        if whole.as_str().len() != text.trim().len() {
            return None;
        }
        Some(Self {
            stage: caps[1].to_string(),
            key: caps[2].to_string(),
            optional: caps.get(3).is_some(),
        })
    }

    /// Renders the reference in `${...}` form.
    #[must_use]
    pub fn placeholder(&self) -> String {
        format!("${{{self}}}")
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage, self.key)?;
        if self.optional {
            f.write_str("?")?;
        }
        Ok(())
    }
}

/// Returns every reference in `text`, in order of appearance.
#[must_use]
pub fn references_in(text: &str) -> Vec<Reference> {
    reference_pattern()
        .captures_iter(text)
        .map(|caps| Reference {
            stage: caps[1].to_string(),
            key: caps[2].to_string(),
            optional: caps.get(3).is_some(),
        })
        .collect()
}

/// Returns every reference in the string leaves of a JSON document.
#[must_use]
pub fn references_in_json(value: &serde_json::Value) -> Vec<Reference> {
    let mut found = Vec::new();
    collect_json(value, &mut found);
    found
}

fn collect_json(value: &serde_json::Value, found: &mut Vec<Reference>) {
    match value {
        serde_json::Value::String(s) => found.extend(references_in(s)),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_json(v, found)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_json(v, found)),
        _ => {}
    }
}

/// Replaces every reference in `text` using `lookup`.
///
/// Stops at the first reference `lookup` rejects and returns it with the
/// rejection reason.
pub(crate) fn substitute<F>(text: &str, mut lookup: F) -> Result<String, (Reference, String)>
where
    F: FnMut(&Reference) -> Result<String, String>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in reference_pattern().captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let reference = Reference {
            stage: caps[1].to_string(),
            key: caps[2].to_string(),
            optional: caps.get(3).is_some(),
        };
        let value = lookup(&reference).map_err(|reason| (reference, reason))?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_single_reference() {
        let r = Reference::parse("${infra.clusterName}").unwrap();
        assert_eq!(r, Reference::new("infra", "clusterName"));
        assert_eq!(r.placeholder(), "${infra.clusterName}");

        let r = Reference::parse(" ${ infra.registryName? } ").unwrap();
        assert!(r.optional);
        assert_eq!(r.to_string(), "infra.registryName?");

        assert!(Reference::parse("prefix-${infra.x}").is_none());
        assert!(Reference::parse("infra.clusterName").is_none());
    }

    #[test]
    fn test_references_in_text_and_json() {
        let refs = references_in("${infra.registryServer}/agent:${build.tag}");
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1].stage, "build");

        let doc = serde_json::json!({
            "storage": {"class": "${infra.storageClass}"},
            "replicas": 1,
            "hosts": ["${infra.fqdn?}"]
        });
        let refs = references_in_json(&doc);
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn test_substitute_embeds_values() {
        let out = substitute("${a.x}-${b.y}!", |r| Ok(format!("<{}>", r.key))).unwrap();
        assert_eq!(out, "<x>-<y>!");

        let plain = substitute("no refs here", |_| Err("unused".into())).unwrap();
        assert_eq!(plain, "no refs here");
    }

    #[test]
    fn test_substitute_reports_first_failure() {
        let err = substitute("${a.x} ${b.y}", |r| {
            if r.stage == "b" {
                Err("missing".to_string())
            } else {
                Ok("ok".to_string())
            }
        })
        .unwrap_err();
        assert_eq!(err.0, Reference::new("b", "y"));
        assert_eq!(err.1, "missing");
    }
}
