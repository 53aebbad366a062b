//! Output sink for human-readable progress messages.
//!
//! Steps write to a `Ui`; nothing in the engine ever reads from it.

use std::sync::Mutex;

/// Write-only progress channel.
pub trait Ui: Send + Sync {
    /// Announce a major action (e.g., "Creating server instance ...").
    fn say(&self, msg: &str);

    /// Detail line under the last announcement.
    fn message(&self, msg: &str);

    /// Report a failure.
    fn error(&self, msg: &str);
}

/// Forwards every line to `tracing` and to the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUi;

impl Ui for TracingUi {
    fn say(&self, msg: &str) {
        tracing::info!("{}", msg);
        println!("==> {}", msg);
    }

    fn message(&self, msg: &str) {
        tracing::debug!("{}", msg);
        println!("    {}", msg);
    }

    fn error(&self, msg: &str) {
        tracing::error!("{}", msg);
        eprintln!("==> ERROR: {}", msg);
    }
}

/// Keeps every line in memory. Used by tests and the rehearsal report.
#[derive(Debug, Default)]
pub struct RecordingUi {
    lines: Mutex<Vec<UiLine>>,
}

/// One recorded line with its severity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiLine {
    Say(String),
    Message(String),
    Error(String),
}

impl UiLine {
    pub fn text(&self) -> &str {
        match self {
            Self::Say(s) | Self::Message(s) | Self::Error(s) => s,
        }
    }
}

impl RecordingUi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every line recorded so far.
    pub fn lines(&self) -> Vec<UiLine> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Only the error lines.
    pub fn errors(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter_map(|line| match line {
                UiLine::Error(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn push(&self, line: UiLine) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line);
        }
    }
}

impl Ui for RecordingUi {
    fn say(&self, msg: &str) {
        self.push(UiLine::Say(msg.to_string()));
    }

    fn message(&self, msg: &str) {
        self.push(UiLine::Message(msg.to_string()));
    }

    fn error(&self, msg: &str) {
        self.push(UiLine::Error(msg.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_ui_keeps_order_and_severity() {
        let ui = RecordingUi::new();
        ui.say("Creating login key ...");
        ui.message("key: packer-1");
        ui.error("quota exceeded");

        let lines = ui.lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], UiLine::Say("Creating login key ...".to_string()));
        assert_eq!(lines[1].text(), "key: packer-1");
        assert_eq!(ui.errors(), vec!["quota exceeded".to_string()]);
    }
}
