use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A display configuration: width x height at a refresh rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Mode {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
}

impl Mode {
    pub const fn new(width: u32, height: u32, refresh_hz: u32) -> Self {
        Self {
            width,
            height,
            refresh_hz,
        }
    }

    pub fn with_refresh(self, refresh_hz: u32) -> Self {
        Self { refresh_hz, ..self }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.refresh_hz)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModeParseError {
    #[error("mode {0:?} is not of the form <W>x<H>x<R>")]
    Shape(String),
    #[error("mode {0:?} has a zero or non-numeric component")]
    Component(String),
    #[error("override {0:?} is not of the form <W>x<H>x<R>=<W>x<H>x<R>")]
    Override(String),
}

impl FromStr for Mode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split(['x', 'X']).collect();
        let [w, h, r] = parts.as_slice() else {
            return Err(ModeParseError::Shape(s.to_string()));
        };
        let component = |v: &str| match v.trim().parse::<u32>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(ModeParseError::Component(s.to_string())),
        };
        Ok(Mode::new(component(w)?, component(h)?, component(r)?))
    }
}

/// Where a [`ModeRequest`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeSource {
    /// The client declared every component.
    Client,
    /// At least one component was missing or unparseable.
    Default,
}

/// The mode a connecting client asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeRequest {
    pub mode: Mode,
    pub source: ModeSource,
}

/// A user rule rewriting one requested mode into another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeOverride {
    pub from: Mode,
    pub to: Mode,
}

impl FromStr for ModeOverride {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (from, to) = s
            .split_once('=')
            .ok_or_else(|| ModeParseError::Override(s.to_string()))?;
        Ok(Self {
            from: from.parse()?,
            to: to.parse()?,
        })
    }
}

/// Overrides in declaration order, parsed once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideTable {
    rules: Vec<ModeOverride>,
}

impl OverrideTable {
    pub fn new(rules: Vec<ModeOverride>) -> Self {
        Self { rules }
    }

    /// Parse `"<W>x<H>x<R>=<W>x<H>x<R>"` strings. Any malformed entry fails
    /// the whole table.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, ModeParseError> {
        let rules = entries
            .iter()
            .map(|e| e.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// First rule whose `from` equals `mode`.
    pub fn lookup(&self, mode: &Mode) -> Option<&ModeOverride> {
        self.rules.iter().find(|rule| rule.from == *mode)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Extract a mode from one line of resolution-tool output.
///
/// Accepts `1920x1080x60`, `1920x1080 @ 60`, `1920x1080 @ 60Hz` and the
/// QRes style `1920x1080, 32 bits @ 60 Hz.`.
pub fn parse_mode_line(line: &str) -> Option<Mode> {
    let line = line.trim();
    if let Ok(mode) = line.parse::<Mode>() {
        return Some(mode);
    }

    let (resolution, rest) = line.split_once('@')?;
    let resolution = resolution.split(',').next()?.trim();
    let (w, h) = resolution.split_once(['x', 'X'])?;
    let refresh: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();

    let width = w.trim().parse().ok()?;
    let height = h.trim().parse().ok()?;
    let refresh_hz = refresh.parse().ok()?;
    if width == 0 || height == 0 || refresh_hz == 0 {
        return None;
    }
    Some(Mode::new(width, height, refresh_hz))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_mode() {
        let mode: Mode = "2560x1440x144".parse().unwrap();
        assert_eq!(mode, Mode::new(2560, 1440, 144));
        assert_eq!(mode.to_string(), "2560x1440x144");
        assert_eq!(" 1280X720x60 ".parse::<Mode>().unwrap(), Mode::new(1280, 720, 60));
    }

    #[test]
    fn reject_malformed_modes() {
        assert!(matches!("1920x1080".parse::<Mode>(), Err(ModeParseError::Shape(_))));
        assert!(matches!("1920x0x60".parse::<Mode>(), Err(ModeParseError::Component(_))));
        assert!(matches!("axbxc".parse::<Mode>(), Err(ModeParseError::Component(_))));
    }

    #[test]
    fn override_table_is_first_match_wins() {
        let table = OverrideTable::parse(&[
            "1280x720x60=3840x2160x60",
            "1280x720x60=1920x1080x60",
        ])
        .unwrap();
        assert_eq!(table.len(), 2);
        let rule = table.lookup(&Mode::new(1280, 720, 60)).unwrap();
        assert_eq!(rule.to, Mode::new(3840, 2160, 60));
        assert!(table.lookup(&Mode::new(1280, 720, 30)).is_none());
    }

    #[test]
    fn one_bad_override_fails_the_table() {
        let err = OverrideTable::parse(&["1280x720x60=3840x2160x60", "1280x720x60"]).unwrap_err();
        assert!(matches!(err, ModeParseError::Override(_)));
    }

    #[test]
    fn tool_output_lines() {
        assert_eq!(
            parse_mode_line("1920x1080, 32 bits @ 60 Hz."),
            Some(Mode::new(1920, 1080, 60))
        );
        assert_eq!(parse_mode_line("3840x2160 @ 120Hz"), Some(Mode::new(3840, 2160, 120)));
        assert_eq!(parse_mode_line("1280x720x30"), Some(Mode::new(1280, 720, 30)));
        assert_eq!(parse_mode_line("QRes v1.1 Copyright (C) Anders Kjersem."), None);
        assert_eq!(parse_mode_line(""), None);
    }
}
