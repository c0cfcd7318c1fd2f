//! Note frontmatter: `---`-delimited YAML header + body, reserved keys, and
//! the per-field merge policy table (spec §4.5 step 4, §6).

use std::collections::BTreeMap;

use chrono::Utc;
use serde_yaml::Value;
use thiserror::Error;

pub const KEY_UID: &str = "kohl-uid";
pub const KEY_PREV_UIDS: &str = "kohl-prev-uids";
pub const KEY_CONFLICTS: &str = "conflicts";
pub const KEY_NEEDS_REVIEW: &str = "needs-review";
pub const KEY_LAST_MERGED: &str = "last-merged";

const OVERWRITE_FIELDS: &[&str] = &[
    "highlightCount",
    "noteCount",
    "pages",
    "lastRead",
    "firstRead",
    "progress",
    "readingStatus",
    "averageTimePerPage",
    "totalReadTime",
];

const PRESERVE_IF_MISSING_FIELDS: &[&str] = &[
    "title",
    "authors",
    "description",
    "keywords",
    "series",
    "language",
];

/// Per-field frontmatter merge policy (§4.5 step 4). Unknown fields default
/// to `PreserveAlways`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    /// Replace with the incoming value if the incoming value is non-empty.
    Overwrite,
    /// Keep the existing value if present; otherwise take the incoming one.
    PreserveIfMissing,
    /// Never change — user-introduced fields, and any field the host
    /// configuration disables.
    PreserveAlways,
}

pub fn policy_for(field: &str, disabled_fields: &[String]) -> FieldPolicy {
    if disabled_fields.iter().any(|f| f == field) {
        return FieldPolicy::PreserveAlways;
    }
    if OVERWRITE_FIELDS.contains(&field) {
        FieldPolicy::Overwrite
    } else if PRESERVE_IF_MISSING_FIELDS.contains(&field) {
        FieldPolicy::PreserveIfMissing
    } else {
        FieldPolicy::PreserveAlways
    }
}

#[derive(Debug, Error)]
pub enum FrontmatterError {
    #[error("invalid YAML frontmatter: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A note split into its header (ordered map, YAML-typed values) and body.
#[derive(Debug, Clone, Default)]
pub struct Note {
    pub frontmatter: BTreeMap<String, Value>,
    pub body: String,
}

impl Note {
    /// Split `content` into `(frontmatter, body)` per §4.5 step 1. A note
    /// with no `---`-delimited header parses as an empty frontmatter map
    /// and the whole content as body.
    pub fn parse(content: &str) -> Result<Self, FrontmatterError> {
        if let Some(rest) = content.strip_prefix("---\n") {
            if let Some(end) = rest.find("\n---\n") {
                let header = &rest[..end];
                let body = &rest[end + "\n---\n".len()..];
                let frontmatter: BTreeMap<String, Value> = if header.trim().is_empty() {
                    BTreeMap::new()
                } else {
                    serde_yaml::from_str(header)?
                };
                return Ok(Note {
                    frontmatter,
                    body: body.to_string(),
                });
            }
            // Tolerate a header with no closing delimiter at EOF.
            if let Some(end) = rest.find("\n---") {
                if rest[end..].trim_end() == "\n---" {
                    let header = &rest[..end];
                    let frontmatter: BTreeMap<String, Value> = if header.trim().is_empty() {
                        BTreeMap::new()
                    } else {
                        serde_yaml::from_str(header)?
                    };
                    return Ok(Note {
                        frontmatter,
                        body: String::new(),
                    });
                }
            }
        }
        Ok(Note {
            frontmatter: BTreeMap::new(),
            body: content.to_string(),
        })
    }

    /// Re-serialize into `---\n<yaml>\n---\n<body>`.
    pub fn render(&self) -> Result<String, FrontmatterError> {
        if self.frontmatter.is_empty() {
            return Ok(self.body.clone());
        }
        let yaml = serde_yaml::to_string(&self.frontmatter)?;
        Ok(format!("---\n{yaml}---\n{}", self.body))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.frontmatter.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.frontmatter.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.frontmatter.remove(key)
    }
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Sequence(seq) => seq.is_empty(),
        Value::Mapping(m) => m.is_empty(),
        _ => false,
    }
}

/// Merge `ours` and `theirs` frontmatter maps per the policy table, writing
/// the result into `ours` in place and stamping `last-merged`.
pub fn merge_frontmatter(
    ours: &mut BTreeMap<String, Value>,
    theirs: &BTreeMap<String, Value>,
    disabled_fields: &[String],
) {
    for (key, incoming) in theirs {
        if key == KEY_UID || key == KEY_PREV_UIDS {
            // Identity fields are exclusively owned by the Identity Service.
            continue;
        }
        match policy_for(key, disabled_fields) {
            FieldPolicy::Overwrite => {
                if !is_empty_value(incoming) {
                    ours.insert(key.clone(), incoming.clone());
                }
            }
            FieldPolicy::PreserveIfMissing => {
                if !ours.contains_key(key) {
                    ours.insert(key.clone(), incoming.clone());
                }
            }
            FieldPolicy::PreserveAlways => {}
        }
    }
    ours.insert(
        KEY_LAST_MERGED.to_string(),
        Value::String(Utc::now().format("%Y-%m-%d").to_string()),
    );
}
