//! Settings surface (spec §6). Config files are loaded in order (later
//! overrides earlier):
//! 1. `~/.config/kohl-import/config.toml` (user defaults)
//! 2. `.kohl-import.toml` in the vault root (vault-specific overrides)
//!
//! CLI flags override all config file values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::highlight::MarkerStyle;

fn default_scan_timeout_seconds() -> u64 {
    8
}

fn default_backup_retention_days() -> u64 {
    30
}

fn default_max_highlight_gap() -> u32 {
    2
}

/// Marker style is persisted in config as a plain string (`"html"` /
/// `"md"` / `"none"`) rather than relying on `MarkerStyle`'s own derive,
/// since this is the one place the wire enum crosses into a user-facing
/// file. The outer `Option` is "recognized at all"; the inner one is the
/// [`convert_style`](crate::highlight::convert_style)-shaped "marker style,
/// or strip markers entirely" choice — `"none"` selects the latter.
fn comment_style_from_str(s: &str) -> Option<Option<MarkerStyle>> {
    match s {
        "html" => Some(Some(MarkerStyle::Html)),
        "markdown" | "md" => Some(Some(MarkerStyle::Markdown)),
        "none" => Some(None),
        _ => None,
    }
}

/// Settings surface (spec §6). All fields optional so a partial config file
/// only overrides what it actually sets; [`Config::load`] merges user and
/// vault config before accessors fill in the remaining defaults.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where materialized notes live. No default: a host must set this.
    pub notes_folder: Option<PathBuf>,
    /// Auto-merge a note when the only change is new highlights and a
    /// snapshot exists for its uid (spec §4.9 gating condition).
    pub auto_merge_on_addition: Option<bool>,
    #[serde(default = "default_scan_timeout_seconds")]
    pub scan_timeout_seconds: u64,
    #[serde(default = "default_backup_retention_days")]
    pub backup_retention_days: u64,
    /// `"html"` or `"markdown"`; stored as a string so unknown values in a
    /// forward-written config file don't fail to parse.
    pub comment_style: Option<String>,
    #[serde(default = "default_max_highlight_gap")]
    pub max_highlight_gap: u32,
    pub use_custom_file_name_template: Option<bool>,
    pub file_name_template: Option<String>,
    #[serde(default)]
    pub disabled_fields: Vec<String>,
    #[serde(default)]
    pub custom_fields: Vec<String>,
}

impl Config {
    pub const DEFAULT_SCAN_TIMEOUT_SECONDS: u64 = 8;
    pub const DEFAULT_BACKUP_RETENTION_DAYS: u64 = 30;
    pub const DEFAULT_MAX_HIGHLIGHT_GAP: u32 = 2;

    /// Loads configuration from the user config directory and `vault_root`,
    /// vault config taking precedence.
    pub fn load(vault_root: &Path) -> Self {
        let user_config = dirs::config_dir()
            .map(|d| d.join("kohl-import/config.toml"))
            .and_then(|p| Self::load_file(&p))
            .unwrap_or_default();

        let vault_config =
            Self::load_file(&vault_root.join(".kohl-import.toml")).unwrap_or_default();

        let merged = user_config.override_with(vault_config);
        tracing::debug!(
            notes_folder = ?merged.notes_folder,
            auto_merge_on_addition = ?merged.auto_merge_on_addition,
            scan_timeout_seconds = merged.scan_timeout_seconds,
            backup_retention_days = merged.backup_retention_days,
            disabled_fields = merged.disabled_fields.len(),
            "effective config after merge"
        );
        merged
    }

    fn load_file(path: &Path) -> Option<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read config");
                return None;
            }
        };
        match toml::from_str::<Self>(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to parse config");
                None
            }
        }
    }

    /// Layers `other` on top of `self`; `other` wins field-by-field where
    /// present. Vec fields (`disabled_fields`, `custom_fields`) are unioned
    /// rather than replaced, since a vault override usually wants to add
    /// to, not discard, the user's defaults.
    fn override_with(self, other: Self) -> Self {
        let mut disabled_fields = self.disabled_fields;
        for f in other.disabled_fields {
            if !disabled_fields.contains(&f) {
                disabled_fields.push(f);
            }
        }
        let mut custom_fields = self.custom_fields;
        for f in other.custom_fields {
            if !custom_fields.contains(&f) {
                custom_fields.push(f);
            }
        }

        Config {
            notes_folder: other.notes_folder.or(self.notes_folder),
            auto_merge_on_addition: other.auto_merge_on_addition.or(self.auto_merge_on_addition),
            scan_timeout_seconds: if other.scan_timeout_seconds != default_scan_timeout_seconds() {
                other.scan_timeout_seconds
            } else {
                self.scan_timeout_seconds
            },
            backup_retention_days: if other.backup_retention_days
                != default_backup_retention_days()
            {
                other.backup_retention_days
            } else {
                self.backup_retention_days
            },
            comment_style: other.comment_style.or(self.comment_style),
            max_highlight_gap: if other.max_highlight_gap != default_max_highlight_gap() {
                other.max_highlight_gap
            } else {
                self.max_highlight_gap
            },
            use_custom_file_name_template: other
                .use_custom_file_name_template
                .or(self.use_custom_file_name_template),
            file_name_template: other.file_name_template.or(self.file_name_template),
            disabled_fields,
            custom_fields,
        }
    }

    pub fn auto_merge_on_addition_or_default(&self) -> bool {
        self.auto_merge_on_addition.unwrap_or(true)
    }

    /// `Some(style)` renders markers in that style; `None` means the
    /// configured mode is `"none"` — strip markers entirely.
    pub fn comment_style_or_default(&self) -> Option<MarkerStyle> {
        self.comment_style
            .as_deref()
            .and_then(comment_style_from_str)
            .unwrap_or(Some(MarkerStyle::Html))
    }

    pub fn scan_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.scan_timeout_seconds)
    }

    pub fn backup_retention(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.backup_retention_days * 24 * 60 * 60)
    }

    pub fn use_custom_file_name_template_or_default(&self) -> bool {
        self.use_custom_file_name_template.unwrap_or(false)
    }
}
