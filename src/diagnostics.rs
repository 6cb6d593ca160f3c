//! Per-pass diagnostic log
//!
//! Every generation pass accumulates a plain-text transcript of what was
//! merged, skipped, and failed. The lines mirror the structured log output
//! so the blob can be returned to callers (and surfaced by a controlled
//! server) without access to the process logs.

use tracing::{debug, error, info};

/// Accumulates `[LEVEL] message` lines for one generation pass
#[derive(Debug, Default)]
pub struct Diagnostics {
    buffer: String,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        info!("{}", message);
        self.push("INFO", message);
    }

    pub fn debug(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!("{}", message);
        self.push("DEBUG", message);
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        error!("{}", message);
        self.push("ERROR", message);
    }

    pub fn append_raw(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    pub fn as_text(&self) -> &str {
        &self.buffer
    }

    pub fn into_text(self) -> String {
        self.buffer
    }

    fn push(&mut self, level: &str, message: &str) {
        self.buffer.push('[');
        self.buffer.push_str(level);
        self.buffer.push_str("] ");
        self.buffer.push_str(message);
        self.buffer.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_tagged() {
        let mut diags = Diagnostics::new();
        diags.info("merged base file");
        diags.error("config 7 unreadable");
        assert_eq!(
            diags.as_text(),
            "[INFO] merged base file\n[ERROR] config 7 unreadable\n"
        );
    }
}
