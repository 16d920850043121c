use std::collections::BTreeMap;

use regex::Regex;
use tracing::debug;

/// Captured strings keyed by output name. Empty when the field was not found.
pub type RawField = BTreeMap<&'static str, String>;

/// One field to pull out of the log: the marker that opens its section, the
/// pattern of the value line, and which capture groups land under which name.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub start: Regex,
    pub value: Regex,
    pub groups: Vec<(usize, &'static str)>,
}

impl FieldDef {
    pub fn new(start: &str, value: &str, groups: &[(usize, &'static str)]) -> Self {
        FieldDef {
            start: Regex::new(start).unwrap(),
            value: Regex::new(value).unwrap(),
            groups: groups.to_vec(),
        }
    }

    pub fn extract(&self, lines: &[&str]) -> RawField {
        let out = extract_field(lines, &self.start, &self.value, &self.groups);
        debug!(
            section = self.start.as_str(),
            value = self.value.as_str(),
            found = !out.is_empty(),
            "extracted field"
        );
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Outside,
    Inside,
}

/// Scan `lines` for the first value line after a section marker.
///
/// The marker line itself is never tested as a value line, and once inside a
/// section the scanner stays inside until the value matches. Every requested
/// group must participate in the match, otherwise the result is empty.
pub fn extract_field(
    lines: &[&str],
    start: &Regex,
    value: &Regex,
    groups: &[(usize, &'static str)],
) -> RawField {
    let mut state = ScanState::Outside;
    for line in lines {
        if start.is_match(line) {
            state = ScanState::Inside;
            continue;
        }
        if state == ScanState::Outside {
            continue;
        }
        let Some(caps) = value.captures(line) else {
            continue;
        };
        let mut out = RawField::new();
        for (idx, name) in groups {
            match caps.get(*idx) {
                Some(m) => {
                    out.insert(*name, m.as_str().to_string());
                }
                None => return RawField::new(),
            }
        }
        return out;
    }
    RawField::new()
}

// ── Tests ──
