//! Caddyfile document model
//!
//! A [`Document`] is an ordered forest of [`Block`]s. Blocks are identified
//! by their key tokens (`site.example.com`, `handle /api`, ...) and nest
//! arbitrarily. Fragments produced by the different sources are merged into
//! one aggregate document per generation pass and serialized back to
//! Caddyfile text.
//!
//! Merging is structural: an incoming top-level block whose keys equal an
//! existing sibling's keys is merged recursively into it, everything else is
//! appended. The block with no keys is the Caddyfile global-options block
//! and must serialize ahead of all scoped blocks; the generation pipeline
//! lifts it explicitly via [`Document::remove`] / [`Document::add_block`].

use crate::error::Error;

/// A single configuration block: key tokens plus nested sub-blocks
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    /// Ordered tokens identifying the block (empty for the global block)
    pub keys: Vec<String>,
    /// Nested directives
    pub children: Document,
}

impl Block {
    /// True for the reserved global-options block (no key tokens)
    pub fn is_global_block(&self) -> bool {
        self.keys.is_empty()
    }
}

/// An ordered forest of configuration blocks
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Document {
    pub blocks: Vec<Block>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Append a top-level block without merging
    pub fn add_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    /// Remove the first top-level block structurally equal to `block`
    pub fn remove(&mut self, block: &Block) -> bool {
        match self.blocks.iter().position(|b| b == block) {
            Some(index) => {
                self.blocks.remove(index);
                true
            }
            None => false,
        }
    }

    /// Absorb another document's blocks into this one
    ///
    /// Blocks whose keys equal an existing sibling's keys merge recursively;
    /// all other blocks are appended in their incoming order.
    pub fn merge(&mut self, other: Document) {
        for block in other.blocks {
            self.merge_block(block);
        }
    }

    fn merge_block(&mut self, block: Block) {
        for existing in &mut self.blocks {
            if existing.keys == block.keys {
                existing.children.merge(block.children);
                return;
            }
        }
        self.blocks.push(block);
    }

    /// Render the document as Caddyfile text
    ///
    /// An empty document renders as zero bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        for block in &self.blocks {
            write_block(&mut out, block, 0);
        }
        out.into_bytes()
    }

    /// Parse Caddyfile text into a document
    ///
    /// Tolerates comments and blank lines; fails on unbalanced braces,
    /// unterminated quotes, or tokens trailing a closing brace. Never
    /// panics on garbage input.
    pub fn parse(input: &[u8]) -> Result<Document, Error> {
        let text = std::str::from_utf8(input)
            .map_err(|e| Error::parse(0, format!("invalid utf-8: {}", e)))?;

        let mut current = Document::new();
        let mut stack: Vec<(Vec<String>, Document)> = Vec::new();

        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let mut tokens = tokenize(line, line_no)?;
            if tokens.is_empty() {
                continue;
            }

            if tokens.len() == 1 && tokens[0] == "}" {
                let (keys, parent) = stack
                    .pop()
                    .ok_or_else(|| Error::parse(line_no, "unexpected '}'"))?;
                let children = std::mem::replace(&mut current, parent);
                current.blocks.push(Block { keys, children });
            } else if tokens.last().map(String::as_str) == Some("{") {
                tokens.pop();
                stack.push((tokens, std::mem::take(&mut current)));
            } else if tokens.iter().any(|t| t == "}") {
                return Err(Error::parse(line_no, "tokens around closing brace"));
            } else {
                current.blocks.push(Block {
                    keys: tokens,
                    children: Document::new(),
                });
            }
        }

        if !stack.is_empty() {
            return Err(Error::parse(
                text.lines().count(),
                format!("{} unclosed block(s)", stack.len()),
            ));
        }

        Ok(current)
    }
}

/// Normalize serialized text by parsing and re-rendering it
///
/// On malformed input the bytes pass through unchanged and the problem is
/// reported in the returned diagnostic text.
pub fn process(content: Vec<u8>) -> (Vec<u8>, String) {
    match Document::parse(&content) {
        Ok(document) => (document.serialize(), String::new()),
        Err(err) => (content, format!("[ERROR] {}\n", err)),
    }
}

fn write_block(out: &mut String, block: &Block, depth: usize) {
    for _ in 0..depth {
        out.push('\t');
    }
    let mut first = true;
    for key in &block.keys {
        if !first {
            out.push(' ');
        }
        first = false;
        write_token(out, key);
    }
    if block.children.is_empty() && !block.is_global_block() {
        out.push('\n');
        return;
    }
    if !block.keys.is_empty() {
        out.push(' ');
    }
    out.push_str("{\n");
    for child in &block.children.blocks {
        write_block(out, child, depth + 1);
    }
    for _ in 0..depth {
        out.push('\t');
    }
    out.push_str("}\n");
}

fn write_token(out: &mut String, token: &str) {
    if token.is_empty() || token.chars().any(char::is_whitespace) {
        out.push('"');
        out.push_str(token);
        out.push('"');
    } else {
        out.push_str(token);
    }
}

/// Split one line into tokens, honoring double quotes and `#` comments
pub(crate) fn tokenize(line: &str, line_no: usize) -> Result<Vec<String>, Error> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '#' {
            break;
        } else if c == '"' {
            chars.next();
            let mut token = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some(ch) => token.push(ch),
                    None => return Err(Error::parse(line_no, "unterminated quote")),
                }
            }
            tokens.push(token);
        } else {
            // '#' only opens a comment at a token boundary
            let mut token = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                token.push(ch);
                chars.next();
            }
            tokens.push(token);
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str) -> Document {
        Document::parse(text.as_bytes()).expect("valid caddyfile")
    }

    #[test]
    fn test_empty_document_serializes_to_nothing() {
        assert!(Document::new().serialize().is_empty());
        assert!(doc("").serialize().is_empty());
        assert!(doc("# only a comment\n\n").serialize().is_empty());
    }

    #[test]
    fn test_parse_nested_blocks() {
        let d = doc("example.com {\n\thandle /api {\n\t\treverse_proxy 10.0.0.1:8080\n\t}\n}\n");
        assert_eq!(d.blocks.len(), 1);
        assert_eq!(d.blocks[0].keys, vec!["example.com"]);
        let handle = &d.blocks[0].children.blocks[0];
        assert_eq!(handle.keys, vec!["handle", "/api"]);
        assert_eq!(
            handle.children.blocks[0].keys,
            vec!["reverse_proxy", "10.0.0.1:8080"]
        );
    }

    #[test]
    fn test_parse_global_block() {
        let d = doc("{\n\temail admin@example.com\n}\nexample.com {\n\trespond ok\n}\n");
        assert!(d.blocks[0].is_global_block());
        assert!(!d.blocks[1].is_global_block());
    }

    #[test]
    fn test_parse_quoted_tokens() {
        let d = doc("respond \"hello world\" 200\n");
        assert_eq!(d.blocks[0].keys, vec!["respond", "hello world", "200"]);
        let rendered = String::from_utf8(d.serialize()).unwrap();
        assert_eq!(rendered, "respond \"hello world\" 200\n");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Document::parse(b"site {\n").is_err());
        assert!(Document::parse(b"}\n").is_err());
        assert!(Document::parse(b"respond \"open\n").is_err());
        assert!(Document::parse(b"} trailing\n").is_err());
    }

    #[test]
    fn test_serialize_round_trips_structure() {
        let d = doc("a.com {\n\tb c\n}\nd e f\n");
        let again = Document::parse(&d.serialize()).unwrap();
        assert_eq!(d, again);
    }

    #[test]
    fn test_merge_appends_distinct_blocks() {
        let mut left = doc("a.com {\n\trespond a\n}\n");
        left.merge(doc("b.com {\n\trespond b\n}\n"));
        assert_eq!(left.blocks.len(), 2);
    }

    #[test]
    fn test_merge_recurses_on_equal_keys() {
        let mut left = doc("a.com {\n\thandle /x {\n\t\trespond x\n\t}\n}\n");
        left.merge(doc("a.com {\n\thandle /y {\n\t\trespond y\n\t}\n}\n"));
        assert_eq!(left.blocks.len(), 1);
        assert_eq!(left.blocks[0].children.blocks.len(), 2);
    }

    #[test]
    fn test_merge_with_self_is_idempotent() {
        let original = doc("{\n\temail a@b.c\n}\na.com {\n\treverse_proxy 10.0.0.1\n}\n");
        let mut merged = original.clone();
        merged.merge(original.clone());
        assert_eq!(merged, original);
    }

    #[test]
    fn test_process_normalizes_whitespace() {
        let (normalized, logs) = process(b"a.com   {\n   respond  ok\n }\n".to_vec());
        assert_eq!(String::from_utf8(normalized).unwrap(), "a.com {\n\trespond ok\n}\n");
        assert!(logs.is_empty());
    }

    #[test]
    fn test_process_passes_malformed_input_through() {
        let (unchanged, logs) = process(b"a.com {\n".to_vec());
        assert_eq!(unchanged, b"a.com {\n");
        assert!(logs.contains("[ERROR]"));
    }

    #[test]
    fn test_remove_lifts_block() {
        let mut d = doc("{\n\temail a@b.c\n}\na.com {\n\trespond ok\n}\n");
        let global = d.blocks[0].clone();
        assert!(d.remove(&global));
        assert_eq!(d.blocks.len(), 1);
        assert!(!d.remove(&global));

        let mut lifted = Document::new();
        lifted.add_block(global);
        assert!(lifted.blocks[0].is_global_block());
    }
}
