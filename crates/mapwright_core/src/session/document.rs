//! Document identity and the per-document session wrapper.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::dmm::MapData;

/// Stable identity of one logical map document within a session.
///
/// Ids come from a session-local counter, memoized per canonical source
/// path: opening the same file twice (however the path was spelled) yields
/// the same id, and so does reopening it after a close. A "save as"
/// aliases the new path to the existing id. Nothing about the id is
/// derived from the path itself, so collisions cannot happen.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MapId(u64);

impl MapId {
    /// Wrap a raw id value
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id value
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map#{}", self.0)
    }
}

/// One open map: the parsed data plus where it came from and which
/// z-level the editor is looking at.
///
/// Live documents are owned by the session and handed out as
/// `Arc<RwLock<MapDocument>>`; editing code mutates `data` in place
/// through that handle.
#[derive(Debug)]
pub struct MapDocument {
    /// Identity within the session
    pub id: MapId,
    /// Canonical path of the file on disk; rebound by "save as"
    pub source_path: PathBuf,
    /// Parsed map content
    pub data: MapData,
    /// Active z-level, 1-based; always within `1..=data.size().z`
    pub selected_z: u32,
}

impl MapDocument {
    /// A freshly opened document looking at the first z-level
    pub fn new(id: MapId, source_path: PathBuf, data: MapData) -> Self {
        Self {
            id,
            source_path,
            data,
            selected_z: 1,
        }
    }

    /// Number of z-levels in the map
    pub fn depth(&self) -> u32 {
        self.data.size().z
    }

    /// File name of the source path, for tab labels and log lines
    pub fn display_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source_path.display().to_string())
    }
}
