// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! CLI utilities for terminal output formatting and colors.

use crossterm::tty::IsTty;
use std::io::stdout;

use crate::lsp::{ServerState, ServerStatus};

/// Configuration for color output
#[derive(Debug, Clone)]
pub struct ColorConfig {
    /// Whether ANSI escapes are emitted.
    pub enabled: bool,
}

impl ColorConfig {
    /// Create a new `ColorConfig`, auto-detecting TTY unless nocolor is true
    #[must_use]
    pub fn new(nocolor: bool) -> Self {
        Self {
            enabled: !nocolor && stdout().is_tty(),
        }
    }

    fn paint(&self, code: &str, s: &str) -> String {
        if self.enabled {
            format!("\x1b[{code}m{s}\x1b[0m")
        } else {
            s.to_string()
        }
    }

    /// Green (healthy)
    #[must_use]
    pub fn green(&self, s: &str) -> String {
        self.paint("32", s)
    }

    /// Yellow (transitional)
    #[must_use]
    pub fn yellow(&self, s: &str) -> String {
        self.paint("33", s)
    }

    /// Red (errors)
    #[must_use]
    pub fn red(&self, s: &str) -> String {
        self.paint("31", s)
    }

    /// Cyan (server names)
    #[must_use]
    pub fn cyan(&self, s: &str) -> String {
        self.paint("36", s)
    }

    /// Dim text
    #[must_use]
    pub fn dim(&self, s: &str) -> String {
        self.paint("2", s)
    }

    /// Bold text
    #[must_use]
    pub fn bold(&self, s: &str) -> String {
        self.paint("1", s)
    }

    /// Colors a state by health.
    #[must_use]
    pub fn state(&self, state: ServerState, s: &str) -> String {
        match state {
            ServerState::Running => self.green(s),
            ServerState::Starting | ServerState::Initializing | ServerState::Stopping => {
                self.yellow(s)
            }
            ServerState::Crashed => self.red(s),
            ServerState::NotStarted | ServerState::Stopped => self.dim(s),
        }
    }
}

/// Get the terminal width, defaulting to 80 if unable to detect
#[must_use]
pub fn terminal_width() -> usize {
    crossterm::terminal::size().map_or(80, |(w, _)| usize::from(w))
}

/// Truncate a string to `max_len` characters, adding "..." if truncated
#[must_use]
pub fn truncate(s: &str, max_len: usize) -> String {
    if max_len <= 3 {
        return ".".repeat(max_len.min(3));
    }
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{kept}...")
    }
}

/// Renders an uptime as `1h 02m`, `3m 04s` or `12s`.
#[must_use]
pub fn format_uptime(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

/// Column widths for the status table
#[derive(Debug)]
pub struct ColumnWidths {
    /// Server id
    pub server: usize,
    /// Lifecycle state
    pub state: usize,
    /// Open documents
    pub docs: usize,
    /// Uptime
    pub uptime: usize,
    /// Root or progress
    pub detail: usize,
}

impl ColumnWidths {
    /// Calculate column widths based on terminal width
    /// Columns: SERVER | STATE | DOCS | UPTIME | ROOT
    #[must_use]
    pub fn calculate(term_width: usize) -> Self {
        let state = 12;
        let docs = 5;
        let uptime = 8;
        let min_server = 16;
        let min_detail = 20;

        // Four single-space separators
        let fixed = state + docs + uptime + 4;
        let flexible = term_width.saturating_sub(fixed);

        if flexible <= min_server + min_detail {
            Self {
                server: min_server,
                state,
                docs,
                uptime,
                detail: min_detail,
            }
        } else {
            Self {
                server: min_server,
                state,
                docs,
                uptime,
                detail: flexible - min_server,
            }
        }
    }
}

/// Formats the status table header.
#[must_use]
pub fn status_header(widths: &ColumnWidths, colors: &ColorConfig) -> String {
    colors.bold(&format!(
        "{:<sw$} {:<tw$} {:>dw$} {:>uw$} {}",
        "SERVER",
        "STATE",
        "DOCS",
        "UPTIME",
        "ROOT",
        sw = widths.server,
        tw = widths.state,
        dw = widths.docs,
        uw = widths.uptime,
    ))
}

/// Formats one status row; active progress replaces the root column.
#[must_use]
pub fn status_row(status: &ServerStatus, widths: &ColumnWidths, colors: &ColorConfig) -> String {
    let state = format!("{:<w$}", status.state.to_string(), w = widths.state);
    let detail = status.primary_progress().map_or_else(
        || status.root.clone().unwrap_or_else(|| "(workspace)".to_string()),
        |p| match p.percentage {
            Some(pct) => format!("{} {pct}%", p.title),
            None => p.title.clone(),
        },
    );
    format!(
        "{} {} {:>dw$} {:>uw$} {}",
        colors.cyan(&format!(
            "{:<w$}",
            truncate(&status.server, widths.server),
            w = widths.server
        )),
        colors.state(status.state, &state),
        status.open_documents,
        format_uptime(status.uptime_secs),
        truncate(&detail, widths.detail),
        dw = widths.docs,
        uw = widths.uptime,
    )
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Tests use unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use crate::lsp::ProgressSnapshot;

    #[test]
    fn test_truncate_short_string() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("test", 4), "test");
    }

    #[test]
    fn test_truncate_long_string() {
        assert_eq!(truncate("hello world", 8), "hello...");
        assert_eq!(truncate("ünïcödé wörld", 7), "ünïc...");
    }

    #[test]
    fn test_truncate_edge_cases() {
        assert_eq!(truncate("hello", 3), "...");
        assert_eq!(truncate("hello", 2), "..");
        assert_eq!(truncate("hello", 0), "");
    }

    #[test]
    fn test_color_config_disabled() {
        let config = ColorConfig::new(true);
        assert!(!config.enabled);
        assert_eq!(config.green("test"), "test");
        assert_eq!(config.state(ServerState::Crashed, "test"), "test");
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(12), "12s");
        assert_eq!(format_uptime(184), "3m 04s");
        assert_eq!(format_uptime(3720), "1h 02m");
    }

    #[test]
    fn test_column_widths() {
        let wide = ColumnWidths::calculate(120);
        assert_eq!(wide.server, 16);
        assert!(wide.detail > 20);

        let narrow = ColumnWidths::calculate(40);
        assert_eq!(narrow.detail, 20);
    }

    #[test]
    fn test_status_row_prefers_progress() {
        let colors = ColorConfig { enabled: false };
        let widths = ColumnWidths::calculate(100);
        let mut status = ServerStatus {
            server: "rust-analyzer".to_string(),
            root: Some("/w/app".to_string()),
            state: ServerState::Running,
            open_documents: 2,
            progress: Vec::new(),
            uptime_secs: 65,
            spawn_count: 1,
        };
        let row = status_row(&status, &widths, &colors);
        assert!(row.contains("running"));
        assert!(row.ends_with("/w/app"));

        status.progress.push(ProgressSnapshot {
            title: "Indexing".to_string(),
            percentage: Some(40),
            ..ProgressSnapshot::default()
        });
        let row = status_row(&status, &widths, &colors);
        assert!(row.ends_with("Indexing 40%"));
    }
}
