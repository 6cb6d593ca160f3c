//! Caddyfile to wire-payload conversion
//!
//! Controlled servers accept a JSON document on their admin endpoint. The
//! [`ConfigAdapter`] boundary turns serialized Caddyfile bytes into that
//! JSON object; the distribution engine then augments the object with the
//! per-server `admin.listen` directive before pushing. Adapter warnings are
//! logged and never fatal; an adapter error skips distribution for the
//! pass, leaving the previously pushed version authoritative.

use serde_json::{json, Value};

use crate::caddyfile::{Block, Document};
use crate::error::{Error, Result};

/// Result of adapting one serialized configuration
#[derive(Debug, Clone)]
pub struct Adapted {
    /// JSON object sent to controlled servers
    pub payload: Value,
    pub warnings: Vec<String>,
}

/// Converts serialized Caddyfile bytes into the admin-endpoint JSON body
pub trait ConfigAdapter: Send + Sync {
    fn adapt(&self, caddyfile: &[u8]) -> Result<Adapted>;
}

/// Structural adapter: renders the block forest as JSON
///
/// Global options land under `"options"`, scoped blocks under `"config"`,
/// each block as `{"keys": [...], "body": [...]}` with `body` omitted for
/// leaves.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredAdapter;

impl ConfigAdapter for StructuredAdapter {
    fn adapt(&self, caddyfile: &[u8]) -> Result<Adapted> {
        let document =
            Document::parse(caddyfile).map_err(|err| Error::Adapt(err.to_string()))?;

        let mut warnings = Vec::new();
        let mut options = Vec::new();
        let mut config = Vec::new();
        let mut global_blocks = 0usize;

        for block in &document.blocks {
            if block.is_global_block() {
                global_blocks += 1;
                options.extend(block.children.blocks.iter().map(block_node));
            } else {
                config.push(block_node(block));
            }
        }
        if global_blocks > 1 {
            warnings.push(format!("{} global blocks flattened into one", global_blocks));
        }

        let mut payload = json!({ "config": config });
        if !options.is_empty() {
            payload["options"] = Value::Array(options);
        }

        Ok(Adapted { payload, warnings })
    }
}

fn block_node(block: &Block) -> Value {
    let mut node = json!({ "keys": block.keys });
    if !block.children.is_empty() {
        node["body"] = Value::Array(block.children.blocks.iter().map(block_node).collect());
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapt_shapes_blocks() {
        let adapted = StructuredAdapter
            .adapt(b"{\n\temail a@b.c\n}\nexample.com {\n\thandle /api\n}\n")
            .unwrap();
        assert!(adapted.warnings.is_empty());
        assert_eq!(adapted.payload["options"][0]["keys"][0], "email");
        assert_eq!(adapted.payload["config"][0]["keys"][0], "example.com");
        assert_eq!(
            adapted.payload["config"][0]["body"][0]["keys"],
            serde_json::json!(["handle", "/api"])
        );
    }

    #[test]
    fn test_adapt_empty_input() {
        let adapted = StructuredAdapter.adapt(b"").unwrap();
        assert_eq!(adapted.payload, serde_json::json!({ "config": [] }));
    }

    #[test]
    fn test_adapt_rejects_malformed_input() {
        assert!(StructuredAdapter.adapt(b"site {\n").is_err());
    }
}
