use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::errors::PilotError;

pub const DEFAULT_UNIT_LABEL: &str = "Slide";

/// An item's raw content split into the first unit and the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUnits {
    pub first: String,
    pub remaining: Vec<String>,
    pub full: String,
}

/// Splits raw content on `<label> <n>` markers.
#[derive(Debug, Clone)]
pub struct UnitSplitter {
    first_marker: Regex,
    second_marker: Regex,
    boundary: Regex,
}

impl UnitSplitter {
    pub fn new(label: &str) -> Result<Self, PilotError> {
        let label = regex::escape(label);
        let build = |pattern: String| {
            RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| PilotError::InvalidArgument(format!("unit label: {e}")))
        };
        Ok(Self {
            first_marker: build(format!(r"{label}\s*1"))?,
            second_marker: build(format!(r"{label}\s*2"))?,
            boundary: build(format!(r"\n{label}\s*\d+"))?,
        })
    }

    pub fn split(&self, raw: &str) -> ContentUnits {
        ContentUnits {
            first: self.first_unit(raw),
            remaining: self.remaining_units(raw),
            full: raw.to_string(),
        }
    }

    /// From the first `<label> 1` marker up to the next line that starts a
    /// unit. Falls back to the whole content when there is no marker.
    pub fn first_unit(&self, raw: &str) -> String {
        let Some(start) = self.first_marker.find(raw) else {
            warn!("No first-unit marker found, using full content");
            return raw.to_string();
        };
        let end = self
            .boundary
            .find_at(raw, start.end())
            .map(|m| m.start())
            .unwrap_or(raw.len());
        raw[start.start()..end].trim().to_string()
    }

    /// Every unit from the first `<label> 2` marker on, trimmed, empties dropped.
    pub fn remaining_units(&self, raw: &str) -> Vec<String> {
        let Some(start) = self.second_marker.find(raw) else {
            debug!("No second-unit marker found");
            return Vec::new();
        };
        let tail = &raw[start.start()..];

        let mut units = Vec::new();
        let mut from = 0;
        for boundary in self.boundary.find_iter(tail) {
            units.push(&tail[from..boundary.start()]);
            // Keep the marker with the unit it opens; drop only the newline.
            from = boundary.start() + 1;
        }
        units.push(&tail[from..]);

        units
            .into_iter()
            .map(str::trim)
            .filter(|unit| !unit.is_empty())
            .map(str::to_string)
            .collect()
    }
}
