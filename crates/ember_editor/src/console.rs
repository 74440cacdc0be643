// console.rs - Editor console messages
//
// The console window itself is drawn elsewhere; this keeps the message
// list it shows and mirrors every message to `tracing`.

use std::collections::HashSet;
use tracing::{error, info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConsoleLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleMessage {
    pub level: ConsoleLevel,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct Console {
    messages: Vec<ConsoleMessage>,
    once: HashSet<String>,
}

impl Console {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, text: impl Into<String>) {
        let text = text.into();
        info!(target: "console", "{text}");
        self.push(ConsoleLevel::Info, text);
    }

    pub fn warn(&mut self, text: impl Into<String>) {
        let text = text.into();
        warn!(target: "console", "{text}");
        self.push(ConsoleLevel::Warning, text);
    }

    pub fn error(&mut self, text: impl Into<String>) {
        let text = text.into();
        error!(target: "console", "{text}");
        self.push(ConsoleLevel::Error, text);
    }

    /// Warn only the first time `key` is seen.
    pub fn warn_once(&mut self, key: impl Into<String>, text: impl Into<String>) -> bool {
        if !self.once.insert(key.into()) {
            return false;
        }
        self.warn(text);
        true
    }

    /// Forget one-time warnings whose key starts with `prefix`, so they fire
    /// again (used when a module is reloaded).
    pub fn reset_once(&mut self, prefix: &str) {
        self.once.retain(|key| !key.starts_with(prefix));
    }

    fn push(&mut self, level: ConsoleLevel, text: String) {
        self.messages.push(ConsoleMessage { level, text });
    }

    pub fn messages(&self) -> &[ConsoleMessage] {
        &self.messages
    }

    pub fn count(&self, level: ConsoleLevel) -> usize {
        self.messages.iter().filter(|m| m.level == level).count()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
