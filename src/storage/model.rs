//! Domain records stored by the index

/// A named position in source code, identified by a unique string
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    identifier: String,
}

impl Location {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.identifier)
    }
}

/// Category of facts, e.g. "references" or "type-hierarchy"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(String);

impl LayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something a file depends on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dependency {
    /// Facts about `location` in `layer`
    Location { location: Location, layer: LayerId },
    /// Another file as a whole
    File { path: String },
}

/// Per-file metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// Modification stamp of the indexed contents
    pub version: i64,
    /// Locations declared in this file
    pub source_locations: Vec<Location>,
    pub internal_dependencies: Vec<Dependency>,
    pub external_dependencies: Vec<Dependency>,
}

impl FileInfo {
    pub fn new(version: i64) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }
}

/// Facts about one location within one layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationInfo {
    pub sources: Vec<Location>,
    pub destinations: Vec<Location>,
}

impl LocationInfo {
    pub fn with_sources(sources: Vec<Location>) -> Self {
        Self {
            sources,
            destinations: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.destinations.is_empty()
    }
}

/// File path and the version it was last indexed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathAndStamp {
    pub path: String,
    pub stamp: i64,
}
