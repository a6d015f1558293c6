//! Hierarchical artifact paths inside an export tree.
//!
//! Artifact paths follow the pattern: `area/[section/]name`. Run-level
//! artifacts (checkpoint, summary) live at the root of the tree.
//!
//! # Examples
//!
//! ```
//! use firesafe_storage::{ArtifactArea, ArtifactPath};
//!
//! let path = ArtifactPath::segment(ArtifactArea::Firestore, "00000003.ndjson");
//! assert_eq!(path.to_string(), "firestore/segments/00000003.ndjson");
//!
//! let prefix = ArtifactPath::new(ArtifactArea::Firestore).with_section("segments");
//! assert_eq!(prefix.to_string(), "firestore/segments");
//!
//! let path = ArtifactPath::run_file(".checkpoint.json");
//! assert_eq!(path.to_string(), ".checkpoint.json");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Top-level area of the export tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactArea {
    /// Run-level files at the root of the tree
    Run,
    /// Document database
    Firestore,
    /// Authentication directory
    Auth,
    /// Blob store
    Storage,
    /// Hierarchical realtime database
    RealtimeDb,
}

impl ArtifactArea {
    /// Directory name for this area (empty for run-level artifacts).
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactArea::Run => "",
            ArtifactArea::Firestore => "firestore",
            ArtifactArea::Auth => "auth",
            ArtifactArea::Storage => "storage",
            ArtifactArea::RealtimeDb => "realtime_db",
        }
    }

    /// Parse an area from its directory name.
    pub fn from_dir_name(s: &str) -> Option<Self> {
        match s {
            "firestore" => Some(ArtifactArea::Firestore),
            "auth" => Some(ArtifactArea::Auth),
            "storage" => Some(ArtifactArea::Storage),
            "realtime_db" => Some(ArtifactArea::RealtimeDb),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactArea::Run => write!(f, "run"),
            other => write!(f, "{}", other.dir_name()),
        }
    }
}

/// Hierarchical path for an export artifact.
///
/// Format: `area/[section/]name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactPath {
    /// Area of the export tree
    pub area: ArtifactArea,
    /// Optional sub-directory inside the area
    pub section: Option<String>,
    /// File name
    pub name: String,
}

impl ArtifactPath {
    /// Create a new artifact path prefix for an area.
    pub fn new(area: ArtifactArea) -> Self {
        Self {
            area,
            section: None,
            name: String::new(),
        }
    }

    /// Add section to path.
    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    /// Path for a run-level file at the root of the tree.
    pub fn run_file(name: impl Into<String>) -> Self {
        Self {
            area: ArtifactArea::Run,
            section: None,
            name: name.into(),
        }
    }

    /// Path for a file directly inside an area.
    pub fn area_file(area: ArtifactArea, name: impl Into<String>) -> Self {
        Self {
            area,
            section: None,
            name: name.into(),
        }
    }

    /// Path for a committed batch segment.
    pub fn segment(area: ArtifactArea, name: impl Into<String>) -> Self {
        Self {
            area,
            section: Some("segments".to_string()),
            name: name.into(),
        }
    }

    /// Path for a downloaded attachment.
    pub fn attachment(area: ArtifactArea, name: impl Into<String>) -> Self {
        Self {
            area,
            section: Some("files".to_string()),
            name: name.into(),
        }
    }

    /// Directory prefix (without name).
    pub fn prefix(&self) -> String {
        let area = self.area.dir_name();
        match (&self.section, area.is_empty()) {
            (Some(section), false) => format!("{}/{}", area, section),
            (Some(section), true) => section.clone(),
            (None, _) => area.to_string(),
        }
    }

    /// Convert to filesystem path.
    pub fn to_path_buf(&self, base: &std::path::Path) -> PathBuf {
        let mut path = base.to_path_buf();
        let area = self.area.dir_name();
        if !area.is_empty() {
            path = path.join(area);
        }
        if let Some(section) = &self.section {
            path = path.join(section);
        }
        if !self.name.is_empty() {
            path = path.join(&self.name);
        }
        path
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() {
            return None;
        }
        let parts: Vec<&str> = s.split('/').collect();

        match ArtifactArea::from_dir_name(parts[0]) {
            Some(area) => match parts.len() {
                1 => Some(Self::new(area)),
                2 => Some(Self::area_file(area, parts[1])),
                _ => Some(Self {
                    area,
                    section: Some(parts[1].to_string()),
                    name: parts[2..].join("/"),
                }),
            },
            None if parts.len() == 1 => Some(Self::run_file(parts[0])),
            None => None,
        }
    }
}

impl fmt::Display for ArtifactPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = self.prefix();
        match (prefix.is_empty(), self.name.is_empty()) {
            (true, _) => write!(f, "{}", self.name),
            (false, true) => write!(f, "{}", prefix),
            (false, false) => write!(f, "{}/{}", prefix, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_path_display() {
        let path = ArtifactPath::segment(ArtifactArea::Firestore, "00000001.ndjson");
        assert_eq!(path.to_string(), "firestore/segments/00000001.ndjson");
    }

    #[test]
    fn test_artifact_path_area_file() {
        let path = ArtifactPath::area_file(ArtifactArea::RealtimeDb, "metadata.json");
        assert_eq!(path.to_string(), "realtime_db/metadata.json");
    }

    #[test]
    fn test_artifact_path_run_file() {
        let path = ArtifactPath::run_file("export_summary.json");
        assert_eq!(path.to_string(), "export_summary.json");
        assert_eq!(path.prefix(), "");
    }

    #[test]
    fn test_artifact_path_parse() {
        let path = ArtifactPath::parse("storage/files/logo.png").unwrap();
        assert_eq!(path.area, ArtifactArea::Storage);
        assert_eq!(path.section, Some("files".to_string()));
        assert_eq!(path.name, "logo.png");

        let path = ArtifactPath::parse("auth/records.ndjson").unwrap();
        assert_eq!(path.area, ArtifactArea::Auth);
        assert_eq!(path.section, None);
        assert_eq!(path.name, "records.ndjson");

        let path = ArtifactPath::parse(".checkpoint.json").unwrap();
        assert_eq!(path.area, ArtifactArea::Run);

        assert!(ArtifactPath::parse("unknown/dir/file").is_none());
        assert!(ArtifactPath::parse("").is_none());
    }

    #[test]
    fn test_artifact_path_prefix() {
        let path = ArtifactPath::attachment(ArtifactArea::Storage, "a.bin");
        assert_eq!(path.prefix(), "storage/files");
        assert_eq!(ArtifactPath::new(ArtifactArea::Auth).to_string(), "auth");
    }

    #[test]
    fn test_artifact_path_to_path_buf() {
        let base = std::path::Path::new("/export");
        let path = ArtifactPath::segment(ArtifactArea::Auth, "00000002.ndjson");
        assert_eq!(
            path.to_path_buf(base),
            PathBuf::from("/export/auth/segments/00000002.ndjson")
        );
        assert_eq!(
            ArtifactPath::run_file(".checkpoint.json").to_path_buf(base),
            PathBuf::from("/export/.checkpoint.json")
        );
    }
}
