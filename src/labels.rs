//! Label-driven configuration fragments
//!
//! Containers and services opt into proxying through labels under a
//! configurable prefix. A label key participates when it matches
//! `<prefix>`, `<prefix>_<n>` (independent rule sets on one entity), or
//! either form followed by a `.`-separated directive path. Everything else
//! is silently ignored.
//!
//! Conversion rules: the bare prefix label's value names a site block
//! (`caddy=example.com`); directive-path labels become nested blocks with
//! the value tokens appended as arguments of the deepest segment
//! (`caddy.handle=/api` → `handle /api`). Paths under a rule set that has a
//! site block nest inside it, otherwise they land at the top level.

use std::collections::{BTreeMap, HashMap};

use crate::caddyfile::{tokenize, Block, Document};

/// Accepts label keys belonging to the configured prefix
#[derive(Debug, Clone)]
pub struct LabelFilter {
    prefix: String,
}

impl LabelFilter {
    pub fn new(prefix: impl Into<String>) -> Self {
        LabelFilter {
            prefix: prefix.into(),
        }
    }

    /// True when `key` is the prefix, an indexed prefix (`prefix_2`), or a
    /// directive path under either form
    pub fn matches(&self, key: &str) -> bool {
        let rest = match key.strip_prefix(&self.prefix) {
            Some(rest) => rest,
            None => return false,
        };
        let rest = match rest.strip_prefix('_') {
            Some(after) => {
                let digits = after.chars().take_while(char::is_ascii_digit).count();
                if digits == 0 {
                    return false;
                }
                &after[digits..]
            }
            None => rest,
        };
        rest.is_empty() || rest.starts_with('.')
    }

    /// Keep only participating labels, sorted for deterministic output
    pub fn filter(&self, labels: &HashMap<String, String>) -> BTreeMap<String, String> {
        labels
            .iter()
            .filter(|(key, _)| self.matches(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// Convert filtered labels into a configuration fragment
pub fn labels_to_document(labels: &BTreeMap<String, String>) -> Document {
    // One group per root segment: `caddy`, `caddy_0`, `caddy_1`, ...
    let mut groups: BTreeMap<String, (Option<String>, Vec<(String, String)>)> = BTreeMap::new();
    for (key, value) in labels {
        match key.split_once('.') {
            Some((root, path)) => {
                groups
                    .entry(root.to_string())
                    .or_default()
                    .1
                    .push((path.to_string(), value.clone()));
            }
            None => {
                groups.entry(key.clone()).or_default().0 = Some(value.clone());
            }
        }
    }

    let mut doc = Document::new();
    for (_root, (site, directives)) in groups {
        let mut fragment = Document::new();
        for (path, value) in directives {
            fragment.merge(directive_chain(&path, &value));
        }
        match site {
            Some(address) if !address.trim().is_empty() => {
                doc.merge(Document {
                    blocks: vec![Block {
                        keys: value_tokens(&address),
                        children: fragment,
                    }],
                });
            }
            _ => doc.merge(fragment),
        }
    }
    doc
}

/// Build the nested block chain for one directive-path label
fn directive_chain(path: &str, value: &str) -> Document {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, outer) = segments.split_last().expect("split produces one segment");

    let mut keys = vec![(*last).to_string()];
    keys.extend(value_tokens(value));
    let mut block = Block {
        keys,
        children: Document::new(),
    };
    for segment in outer.iter().rev() {
        block = Block {
            keys: vec![(*segment).to_string()],
            children: Document { blocks: vec![block] },
        };
    }
    Document { blocks: vec![block] }
}

fn value_tokens(value: &str) -> Vec<String> {
    match tokenize(value, 0) {
        Ok(tokens) => tokens,
        // Unbalanced quoting: keep the raw value as one argument
        Err(_) => vec![value.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_filter_accepts_prefix_and_indexed_forms() {
        let filter = LabelFilter::new("caddy");
        assert!(filter.matches("caddy"));
        assert!(filter.matches("caddy.x"));
        assert!(filter.matches("caddy_2"));
        assert!(filter.matches("caddy_2.x"));
        assert!(!filter.matches("otherprefix.x"));
        assert!(!filter.matches("caddyish.x"));
        assert!(!filter.matches("caddy_.x"));
        assert!(!filter.matches("caddy_two.x"));
    }

    #[test]
    fn test_filter_drops_unmatched_silently() {
        let filter = LabelFilter::new("caddy");
        let filtered = filter.filter(&labels(&[
            ("caddy.handle", "/api"),
            ("otherprefix.handle", "/other"),
            ("com.docker.compose.project", "demo"),
        ]));
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("caddy.handle"));
    }

    #[test]
    fn test_directive_label_becomes_top_level_block() {
        let filter = LabelFilter::new("caddy");
        let doc = labels_to_document(&filter.filter(&labels(&[("caddy.handle", "/api")])));
        assert_eq!(doc.blocks.len(), 1);
        assert_eq!(doc.blocks[0].keys, vec!["handle", "/api"]);
    }

    #[test]
    fn test_site_label_nests_directives() {
        let filter = LabelFilter::new("caddy");
        let doc = labels_to_document(&filter.filter(&labels(&[
            ("caddy", "example.com"),
            ("caddy.reverse_proxy", "10.0.0.2:8080"),
        ])));
        assert_eq!(doc.blocks.len(), 1);
        assert_eq!(doc.blocks[0].keys, vec!["example.com"]);
        assert_eq!(
            doc.blocks[0].children.blocks[0].keys,
            vec!["reverse_proxy", "10.0.0.2:8080"]
        );
    }

    #[test]
    fn test_indexed_rule_sets_stay_independent() {
        let filter = LabelFilter::new("caddy");
        let doc = labels_to_document(&filter.filter(&labels(&[
            ("caddy_0", "a.example.com"),
            ("caddy_0.respond", "a"),
            ("caddy_1", "b.example.com"),
            ("caddy_1.respond", "b"),
        ])));
        assert_eq!(doc.blocks.len(), 2);
        let mut sites: Vec<&str> = doc.blocks.iter().map(|b| b.keys[0].as_str()).collect();
        sites.sort_unstable();
        assert_eq!(sites, vec!["a.example.com", "b.example.com"]);
    }

    #[test]
    fn test_deep_directive_paths_nest() {
        let filter = LabelFilter::new("caddy");
        let doc = labels_to_document(&filter.filter(&labels(&[(
            "caddy.reverse_proxy.health_uri",
            "/health",
        )])));
        assert_eq!(doc.blocks[0].keys, vec!["reverse_proxy"]);
        assert_eq!(
            doc.blocks[0].children.blocks[0].keys,
            vec!["health_uri", "/health"]
        );
    }
}
