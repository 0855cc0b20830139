use chrono::{DateTime, Utc};
use owo_colors::OwoColorize;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

static LOG_LEVEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(trace|debug|info|warn(?:ing)?|err(?:or)?|fatal|panic)\b"#).unwrap()
});

/// Best-effort level from the text of a line.
pub fn detect_log_level(text: &str) -> Option<LogLevel> {
    let m = LOG_LEVEL_RE.find(text)?;
    match m.as_str().to_ascii_lowercase().as_str() {
        "trace" => Some(LogLevel::Trace),
        "debug" => Some(LogLevel::Debug),
        "info" => Some(LogLevel::Info),
        "warn" | "warning" => Some(LogLevel::Warn),
        "err" | "error" | "fatal" | "panic" => Some(LogLevel::Error),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One captured line of service output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub service_id: String,
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
}

impl LogEntry {
    pub fn new(service_id: &str, stream: LogStream, message: String) -> Self {
        Self {
            service_id: service_id.to_string(),
            timestamp: Utc::now(),
            stream,
            level: detect_log_level(&message),
            message,
        }
    }
}

const SERVICE_COLORS: &[fn(&str) -> String] = &[
    |s| format!("{}", s.cyan()),
    |s| format!("{}", s.yellow()),
    |s| format!("{}", s.green()),
    |s| format!("{}", s.magenta()),
    |s| format!("{}", s.blue()),
];

fn format_level(level: LogLevel, use_color: bool) -> String {
    if !use_color {
        return format!("{:>5} ", level.as_str());
    }
    match level {
        LogLevel::Trace => format!("{} ", level.as_str().dimmed()),
        LogLevel::Debug => format!("{} ", level.as_str().blue()),
        LogLevel::Info => format!("{} ", level.as_str().green()),
        LogLevel::Warn => format!("{} ", level.as_str().yellow()),
        LogLevel::Error => format!("{} ", level.as_str().red()),
    }
}

/// Prefixes each line with its service name, one stable color per service.
pub struct LogWriter {
    name_width: usize,
    use_color: bool,
    colors: BTreeMap<String, usize>,
}

impl LogWriter {
    pub fn new(name_width: usize, use_color: bool) -> Self {
        Self {
            name_width,
            use_color,
            colors: BTreeMap::new(),
        }
    }

    pub fn format(&mut self, entry: &LogEntry) -> String {
        let mut buf = String::new();
        if self.use_color {
            let next = self.colors.len() % SERVICE_COLORS.len();
            let idx = *self.colors.entry(entry.service_id.clone()).or_insert(next);
            let padding = self.name_width.saturating_sub(entry.service_id.len());
            buf.push_str(&" ".repeat(padding));
            buf.push_str(&SERVICE_COLORS[idx](&entry.service_id));
            buf.push_str(&format!(" {} ", "|".dimmed()));
        } else {
            buf.push_str(&format!(
                "{:>width$} | ",
                entry.service_id,
                width = self.name_width
            ));
        }

        if let Some(level) = entry.level {
            buf.push_str(&format_level(level, self.use_color));
        }

        if self.use_color && entry.stream == LogStream::Stderr {
            buf.push_str(&format!("{}", entry.message.red()));
        } else {
            buf.push_str(&entry.message);
        }
        buf
    }

    pub fn write(&mut self, entry: &LogEntry) {
        println!("{}", self.format(entry));
    }
}
