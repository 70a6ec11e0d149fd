//! The streaming server's `key = value` config as a list of lines.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use vdsync_config::{write_atomic, RecordedDirective, Settings};

/// One `key = value` setting that enables the virtual display hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    key: String,
    value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("directive {0:?} is not of the form key = value")]
pub struct DirectiveParseError(String);

impl Directive {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into().trim().to_string(),
            value: value.into().trim().to_string(),
        }
    }

    /// `global_prep_cmd` running `<exe> session connect|disconnect` around
    /// every stream.
    pub fn session_hooks(exe: &Path) -> Self {
        let exe = exe.display();
        let value = serde_json::json!([{
            "do": format!("\"{exe}\" session connect"),
            "undo": format!("\"{exe}\" session disconnect"),
            "elevated": "true",
        }]);
        Self::new("global_prep_cmd", value.to_string())
    }

    /// The directive to act on. What install recorded wins over the
    /// configured one, which wins over hooks pointing at `exe`.
    pub fn select(recorded: Option<&Settings>, configured: Option<&str>, exe: &Path) -> Result<Self, DirectiveParseError> {
        if let Some(recorded) = recorded.and_then(|s| s.directive.as_ref()) {
            return Ok(Self::from(recorded));
        }
        match configured {
            Some(raw) => raw.parse(),
            None => Ok(Self::session_hooks(exe)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl From<&RecordedDirective> for Directive {
    fn from(recorded: &RecordedDirective) -> Self {
        Self::new(recorded.key.as_str(), recorded.value.as_str())
    }
}

impl From<&Directive> for RecordedDirective {
    fn from(directive: &Directive) -> Self {
        Self {
            key: directive.key.clone(),
            value: directive.value.clone(),
        }
    }
}

impl FromStr for Directive {
    type Err = DirectiveParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => Ok(Self::new(key, value)),
            _ => Err(DirectiveParseError(s.to_string())),
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.key, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry { key: String, value: String, raw: String },
    Other(String),
}

impl Line {
    fn parse(raw: &str) -> Self {
        let trimmed = raw.trim_start();
        if trimmed.starts_with('#') || trimmed.starts_with(';') {
            return Self::Other(raw.to_string());
        }
        match raw.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => Self::Entry {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
                raw: raw.to_string(),
            },
            _ => Self::Other(raw.to_string()),
        }
    }

    fn raw(&self) -> &str {
        match self {
            Self::Entry { raw, .. } | Self::Other(raw) => raw,
        }
    }

    fn matches(&self, directive: &Directive) -> bool {
        matches!(self, Self::Entry { key, value, .. } if *key == directive.key && *value == directive.value)
    }
}

/// Line-preserving view of the config file. Unrelated lines, their order
/// and the file's line ending style survive any edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    lines: Vec<Line>,
    newline: &'static str,
    trailing_newline: bool,
}

impl ConfigFile {
    pub fn parse(text: &str) -> Self {
        let newline = if text.contains("\r\n") { "\r\n" } else { "\n" };
        if text.is_empty() {
            return Self {
                lines: Vec::new(),
                newline,
                trailing_newline: true,
            };
        }
        let mut pieces: Vec<&str> = text.split('\n').collect();
        let trailing_newline = pieces.last() == Some(&"");
        if trailing_newline {
            pieces.pop();
        }
        let lines = pieces
            .into_iter()
            .map(|piece| Line::parse(piece.strip_suffix('\r').unwrap_or(piece)))
            .collect();
        Self {
            lines,
            newline,
            trailing_newline,
        }
    }

    pub fn read(path: &Path) -> io::Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        write_atomic(path, self.render().as_bytes())
    }

    pub fn render(&self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let mut out = self
            .lines
            .iter()
            .map(Line::raw)
            .collect::<Vec<_>>()
            .join(self.newline);
        if self.trailing_newline {
            out.push_str(self.newline);
        }
        out
    }

    pub fn contains(&self, directive: &Directive) -> bool {
        self.lines.iter().any(|line| line.matches(directive))
    }

    /// Append the directive unless it is already present. Returns whether
    /// the file changed.
    pub fn add(&mut self, directive: &Directive) -> bool {
        if self.contains(directive) {
            return false;
        }
        self.lines.push(Line::parse(&directive.to_string()));
        true
    }

    /// Delete every line carrying the directive. Returns how many went.
    pub fn remove(&mut self, directive: &Directive) -> usize {
        let before = self.lines.len();
        self.lines.retain(|line| !line.matches(directive));
        before - self.lines.len()
    }
}
