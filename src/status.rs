//! Textual status readout for the small on-device panel.

use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Characters per row (128 px panel, 8 px font).
pub const WIDTH: usize = 16;
pub const ROWS: usize = 5;

/// One of the panel's fixed text slots below the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Row(u8);

impl Row {
    /// Bottom line: connection messages, publish ticks, countdowns.
    pub const STATUS: Row = Row(5);

    /// Row for the `index`-th reading (0 based), rows 1 to 4.
    pub fn reading(index: usize) -> Row {
        Row((index.min(ROWS - 2) + 1) as u8)
    }

    pub fn line(n: u8) -> Row {
        Row(n.clamp(1, ROWS as u8))
    }

    fn index(self) -> usize {
        usize::from(self.0) - 1
    }
}

pub trait StatusSink: Send {
    /// Reset the panel with a new inverted header line.
    fn header(&mut self, text: &str);

    fn render(&mut self, left: &str, right: &str, row: Row);

    /// Blank every row below the header.
    fn clear(&mut self);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextPanel {
    header: String,
    rows: [String; ROWS],
}

impl TextPanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header_text(&self) -> &str {
        &self.header
    }

    pub fn row(&self, row: Row) -> &str {
        &self.rows[row.index()]
    }

    /// Left text left-aligned, right text right-aligned; hashes when they do not fit.
    pub fn compose(left: &str, right: &str) -> String {
        let used = left.chars().count() + right.chars().count();
        if used > WIDTH {
            return "#".repeat(WIDTH);
        }
        format!("{}{}{}", left, " ".repeat(WIDTH - used), right)
    }
}

impl StatusSink for TextPanel {
    fn header(&mut self, text: &str) {
        self.clear();
        self.header = text.chars().take(WIDTH).collect();
    }

    fn render(&mut self, left: &str, right: &str, row: Row) {
        self.rows[row.index()] = Self::compose(left, right);
    }

    fn clear(&mut self) {
        for r in self.rows.iter_mut() {
            r.clear();
        }
    }
}

impl fmt::Display for TextPanel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let border = format!("+{}+", "-".repeat(WIDTH));
        writeln!(f, "{}", border)?;
        writeln!(f, "|{:<width$}|", self.header, width = WIDTH)?;
        for r in &self.rows {
            writeln!(f, "|{:<width$}|", r, width = WIDTH)?;
        }
        writeln!(f, "{}", border)
    }
}

/// Panel that mirrors every update to the log and, optionally, to a file an
/// external renderer watches.
pub struct PanelSink {
    panel: TextPanel,
    path: Option<PathBuf>,
}

impl PanelSink {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            panel: TextPanel::new(),
            path,
        }
    }

    pub fn panel(&self) -> &TextPanel {
        &self.panel
    }

    // Blocking write: the file is tiny and must hold the latest render before
    // the loop's next pacing sleep, which an async sink could not promise.
    fn flush(&self) {
        if let Some(path) = &self.path {
            if let Err(e) = std::fs::write(path, self.panel.to_string()) {
                warn!(path = %path.display(), error = %e, "failed to write status panel");
            }
        }
    }
}

impl StatusSink for PanelSink {
    fn header(&mut self, text: &str) {
        self.panel.header(text);
        debug!(header = text, "status header");
        self.flush();
    }

    fn render(&mut self, left: &str, right: &str, row: Row) {
        self.panel.render(left, right, row);
        debug!(row = row.0, line = %self.panel.row(row), "status");
        self.flush();
    }

    fn clear(&mut self) {
        self.panel.clear();
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_aligns_both_sides() {
        assert_eq!(TextPanel::compose("Total:", "36000W"), "Total:    36000W");
        assert_eq!(TextPanel::compose("", "Publish!"), "        Publish!");
        assert_eq!(TextPanel::compose("MQTT", ""), "MQTT            ");
    }

    #[test]
    fn test_compose_overflow_shows_hashes() {
        assert_eq!(
            TextPanel::compose("Connecting WiFi", "..."),
            "################"
        );
        assert_eq!(TextPanel::compose("12345678", "12345678").len(), WIDTH);
    }

    #[test]
    fn test_header_clears_rows() {
        let mut panel = TextPanel::new();
        panel.render("Total:", "1W", Row::reading(0));
        panel.header("  Power usage");
        assert_eq!(panel.header_text(), "  Power usage");
        assert_eq!(panel.row(Row::reading(0)), "");
    }

    #[test]
    fn test_row_mapping() {
        assert_eq!(Row::reading(0), Row::line(1));
        assert_eq!(Row::reading(3), Row::line(4));
        // readings never spill onto the status line
        assert_eq!(Row::reading(9), Row::line(4));
        assert_eq!(Row::line(9), Row::STATUS);
    }

    #[test]
    fn test_panel_sink_writes_file() {
        let path = std::env::temp_dir().join(format!("upower-status-{}.txt", std::process::id()));
        let mut sink = PanelSink::new(Some(path.clone()));
        sink.header("  Power usage");
        sink.render("House:", "-120W", Row::reading(3));

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("|  Power usage   |"));
        assert!(written.contains("|House:     -120W|"));
        assert_eq!(sink.panel().row(Row::reading(3)), "House:     -120W");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_panel_sink_file_tracks_every_update() {
        let path =
            std::env::temp_dir().join(format!("upower-status-seq-{}.txt", std::process::id()));
        let mut sink = PanelSink::new(Some(path.clone()));

        sink.render("", "Publish!", Row::STATUS);
        assert!(std::fs::read_to_string(&path).unwrap().contains("|        Publish!|"));

        sink.clear();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("Publish!"));
        assert_eq!(written, sink.panel().to_string());

        std::fs::remove_file(&path).ok();
    }
}
