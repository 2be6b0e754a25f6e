//! The `.dmm` map format.
//!
//! A map file has two sections: a tile definition table binding short
//! base-52 keys to prefab lists, and one or more grid blocks assigning a
//! key to every coordinate. Two layouts are in circulation: the classic
//! layout BYOND's own editor writes, and the TGM layout produced by
//! tgstation's `dmm2tgm.py`. Both parse into the same [`MapData`]; the
//! writer can emit either.
//!
//! Map files live in version control, so the writer works hard to keep
//! diffs small: see [`serialize`] for how keys are reused against the
//! baseline snapshot taken when a map was opened.

mod parser;
mod writer;

pub use parser::{ParseError, parse};
pub use writer::serialize;

use std::hash::{Hash, Hasher};

use indexmap::IndexMap;

/// Number of distinct characters in a key digit (`a`-`z`, then `A`-`Z`).
pub(crate) const KEY_BASE: u32 = 52;

/// Widest key the parser accepts. 52^5 keys is far beyond any map small
/// enough to satisfy [`MAX_CELLS`].
pub(crate) const MAX_KEY_LENGTH: u8 = 5;

/// Upper bound on `x * y * z` accepted from a file.
pub(crate) const MAX_CELLS: u64 = 16_777_216;

/// Header comment that marks the TGM layout and stops `dmm2tgm.py` from
/// converting a file twice.
pub const TGM_HEADER: &str =
    "//MAP CONVERTED BY dmm2tgm.py THIS HEADER COMMENT PREVENTS RECONVERSION, DO NOT REMOVE";

/// A tile definition key.
///
/// Keys render as fixed-width base-52 text, most significant digit first:
/// at width 2 the value 0 is `aa`, 1 is `ab`, 52 is `ba`. The numeric
/// value is independent of the width it renders at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey(pub(crate) u32);

impl TileKey {
    /// Decode key text like `"aap"`.
    ///
    /// Returns `None` for empty input, characters outside `a-zA-Z`, or
    /// text wider than [`MAX_KEY_LENGTH`].
    pub fn decode(text: &str) -> Option<TileKey> {
        if text.is_empty() || text.len() > MAX_KEY_LENGTH as usize {
            return None;
        }
        let mut value: u32 = 0;
        for ch in text.chars() {
            let digit = match ch {
                'a'..='z' => ch as u32 - 'a' as u32,
                'A'..='Z' => ch as u32 - 'A' as u32 + 26,
                _ => return None,
            };
            value = value * KEY_BASE + digit;
        }
        Some(TileKey(value))
    }

    /// Encode at a fixed width, padding with leading `a` digits.
    ///
    /// The value must fit in `width` digits; callers uphold this by
    /// widening `key_length` before allocating past the current capacity.
    pub fn encode(self, width: u8) -> String {
        let width = width.clamp(1, MAX_KEY_LENGTH) as usize;
        let mut digits = [b'a'; MAX_KEY_LENGTH as usize];
        let mut value = self.0;
        for slot in digits[..width].iter_mut().rev() {
            let digit = (value % KEY_BASE) as u8;
            value /= KEY_BASE;
            *slot = if digit < 26 {
                b'a' + digit
            } else {
                b'A' + digit - 26
            };
        }
        digits[..width].iter().map(|&b| b as char).collect()
    }

    /// The raw numeric value
    pub fn value(self) -> u32 {
        self.0
    }
}

/// One prefab in a tile definition: a type path plus the variable
/// overrides the map sets on it.
///
/// Variable values are kept as raw DM literals (`"floor"`, `8`,
/// `list("a","b")`) exactly as they appear in the file. Equality and
/// hashing are order-sensitive over the variables: two defs that differ
/// only in variable order are different lines of text, and merging them
/// would break byte-stable saves.
#[derive(Debug, Clone, Eq)]
pub struct Prefab {
    /// DM type path, e.g. `/obj/machinery/door/airlock`
    pub path: String,
    /// Variable overrides in file order
    pub vars: IndexMap<String, String>,
}

impl Prefab {
    /// A prefab with no variable overrides
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            vars: IndexMap::new(),
        }
    }

    /// A prefab with variable overrides
    pub fn with_vars<I, K, V>(path: impl Into<String>, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            path: path.into(),
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl PartialEq for Prefab {
    fn eq(&self, other: &Self) -> bool {
        // IndexMap equality ignores order; file identity must not
        self.path == other.path
            && self.vars.len() == other.vars.len()
            && self.vars.iter().zip(other.vars.iter()).all(|(a, b)| a == b)
    }
}

impl Hash for Prefab {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        state.write_usize(self.vars.len());
        for (k, v) in &self.vars {
            k.hash(state);
            v.hash(state);
        }
    }
}

/// The full content of one tile definition: prefabs in file order
pub type TileContent = Vec<Prefab>;

/// Map dimensions. BYOND coordinates are 1-based and inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapSize {
    /// East-west extent
    pub x: u32,
    /// North-south extent
    pub y: u32,
    /// Number of z-levels
    pub z: u32,
}

impl MapSize {
    /// New map dimensions
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub(crate) fn cells(self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }
}

/// The two `.dmm` layouts in circulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapFormat {
    /// Classic layout written by the BYOND map editor: single-line tile
    /// defs, one grid block per z-level
    Byond,
    /// TGM layout: one prefab (and one variable) per line, one grid block
    /// per column, plus a header comment
    Tgm,
}

/// Line ending convention of a map file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    /// Unix newlines
    Lf,
    /// Windows newlines, as BYOND writes on its home platform
    CrLf,
}

impl LineEnding {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

/// Parsed form of a `.dmm` file: the tile definition table plus the grid.
///
/// The same structure serves live documents and the open-time baselines
/// saves diff against. Invariants upheld by the parser and all mutators:
///
/// - every key in the grid has a binding in the definition table
/// - dimensions are at least 1x1x1 and every cell is filled
/// - `key_length` is wide enough to encode every bound key
#[derive(Debug, Clone)]
pub struct MapData {
    size: MapSize,
    /// Row-major: x fastest, then y, then z
    grid: Vec<TileKey>,
    /// Key -> prefab list, in file order
    defs: IndexMap<TileKey, TileContent>,
    key_length: u8,
    format: MapFormat,
    /// Verbatim comment line from the top of the file, if any
    header: Option<String>,
    line_ending: LineEnding,
}

impl MapData {
    /// A map of the given size with every cell pointing at one definition
    /// holding `fill`.
    ///
    /// # Panics
    ///
    /// Panics if any dimension is zero.
    pub fn filled(size: MapSize, fill: TileContent) -> MapData {
        assert!(
            size.x >= 1 && size.y >= 1 && size.z >= 1,
            "map dimensions must be at least 1x1x1"
        );
        let key = TileKey(0);
        let mut defs = IndexMap::new();
        defs.insert(key, fill);
        MapData {
            size,
            grid: vec![key; size.cells() as usize],
            defs,
            key_length: 1,
            format: MapFormat::Byond,
            header: None,
            line_ending: LineEnding::Lf,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        size: MapSize,
        grid: Vec<TileKey>,
        defs: IndexMap<TileKey, TileContent>,
        key_length: u8,
        format: MapFormat,
        header: Option<String>,
        line_ending: LineEnding,
    ) -> MapData {
        MapData {
            size,
            grid,
            defs,
            key_length,
            format,
            header,
            line_ending,
        }
    }

    /// Map dimensions
    pub fn size(&self) -> MapSize {
        self.size
    }

    /// Layout the map was read as
    pub fn format(&self) -> MapFormat {
        self.format
    }

    /// Width of the keys in the definition table
    pub fn key_length(&self) -> u8 {
        self.key_length
    }

    /// Tile definition table, in file order
    pub fn defs(&self) -> &IndexMap<TileKey, TileContent> {
        &self.defs
    }

    pub(crate) fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    pub(crate) fn line_ending(&self) -> LineEnding {
        self.line_ending
    }

    pub(crate) fn grid(&self) -> &[TileKey] {
        &self.grid
    }

    /// True when the coordinate lies inside the map
    pub fn in_bounds(&self, x: u32, y: u32, z: u32) -> bool {
        (1..=self.size.x).contains(&x)
            && (1..=self.size.y).contains(&y)
            && (1..=self.size.z).contains(&z)
    }

    pub(crate) fn index(&self, x: u32, y: u32, z: u32) -> usize {
        (((z - 1) * self.size.y + (y - 1)) * self.size.x + (x - 1)) as usize
    }

    /// Key at a coordinate, or `None` out of bounds
    pub fn tile_key(&self, x: u32, y: u32, z: u32) -> Option<TileKey> {
        self.in_bounds(x, y, z)
            .then(|| self.grid[self.index(x, y, z)])
    }

    /// Prefab list at a coordinate, or `None` out of bounds
    pub fn tile_content(&self, x: u32, y: u32, z: u32) -> Option<&TileContent> {
        let key = self.tile_key(x, y, z)?;
        self.defs.get(&key)
    }

    /// Points a cell at a definition holding `content`, reusing an
    /// existing binding when one matches and allocating the lowest free
    /// key otherwise. Returns the key the cell ends up with, or `None`
    /// out of bounds.
    pub fn set_tile_content(
        &mut self,
        x: u32,
        y: u32,
        z: u32,
        content: TileContent,
    ) -> Option<TileKey> {
        if !self.in_bounds(x, y, z) {
            return None;
        }
        let key = self.key_for(content);
        let idx = self.index(x, y, z);
        self.grid[idx] = key;
        Some(key)
    }

    /// Binding whose content equals `content`, allocating one if missing
    fn key_for(&mut self, content: TileContent) -> TileKey {
        if let Some((key, _)) = self.defs.iter().find(|(_, c)| **c == content) {
            return *key;
        }
        let key = self.lowest_free_key();
        self.defs.insert(key, content);
        key
    }

    /// Lowest key value with no binding, widening `key_length` when the
    /// current width is full
    fn lowest_free_key(&mut self) -> TileKey {
        let mut value = 0u32;
        while self.defs.contains_key(&TileKey(value)) {
            value += 1;
        }
        let capacity = (KEY_BASE as u64).pow(self.key_length as u32);
        if value as u64 >= capacity {
            self.key_length += 1;
            log::warn!(
                "tile key space exhausted, widening keys to {} characters",
                self.key_length
            );
        }
        TileKey(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(text: &str) -> TileKey {
        TileKey::decode(text).unwrap()
    }

    #[test]
    fn key_decode_maps_digits_in_base_52() {
        assert_eq!(key("a").value(), 0);
        assert_eq!(key("z").value(), 25);
        assert_eq!(key("A").value(), 26);
        assert_eq!(key("Z").value(), 51);
        assert_eq!(key("ba").value(), 52);
        assert_eq!(key("aap").value(), 15);
    }

    #[test]
    fn key_decode_rejects_bad_text() {
        assert!(TileKey::decode("").is_none());
        assert!(TileKey::decode("a1").is_none());
        assert!(TileKey::decode("a b").is_none());
        assert!(TileKey::decode("aaaaaa").is_none());
    }

    #[test]
    fn key_encode_pads_to_width() {
        assert_eq!(TileKey(0).encode(1), "a");
        assert_eq!(TileKey(0).encode(3), "aaa");
        assert_eq!(TileKey(1).encode(2), "ab");
        assert_eq!(TileKey(51).encode(2), "aZ");
        assert_eq!(TileKey(52).encode(2), "ba");
    }

    #[test]
    fn key_encode_round_trips_decode() {
        for value in [0u32, 1, 25, 26, 51, 52, 2703, 140_607] {
            let encoded = TileKey(value).encode(3);
            assert_eq!(TileKey::decode(&encoded), Some(TileKey(value)));
        }
    }

    #[test]
    fn prefab_equality_is_order_sensitive() {
        let a = Prefab::with_vars("/obj/door", [("dir", "4"), ("name", "\"door\"")]);
        let b = Prefab::with_vars("/obj/door", [("name", "\"door\""), ("dir", "4")]);
        let c = Prefab::with_vars("/obj/door", [("dir", "4"), ("name", "\"door\"")]);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn set_tile_content_reuses_matching_definition() {
        let floor = vec![Prefab::new("/turf/floor"), Prefab::new("/area")];
        let mut map = MapData::filled(MapSize::new(2, 2, 1), floor.clone());

        let reused = map.set_tile_content(2, 2, 1, floor).unwrap();
        assert_eq!(reused, TileKey(0));
        assert_eq!(map.defs().len(), 1);
    }

    #[test]
    fn set_tile_content_allocates_lowest_free_key() {
        let floor = vec![Prefab::new("/turf/floor")];
        let wall = vec![Prefab::new("/turf/wall")];
        let mut map = MapData::filled(MapSize::new(2, 1, 1), floor);

        let allocated = map.set_tile_content(2, 1, 1, wall.clone()).unwrap();
        assert_eq!(allocated, TileKey(1));
        assert_eq!(map.tile_content(2, 1, 1), Some(&wall));
        assert_eq!(map.tile_key(1, 1, 1), Some(TileKey(0)));
    }

    #[test]
    fn set_tile_content_rejects_out_of_bounds() {
        let mut map = MapData::filled(MapSize::new(2, 2, 1), vec![Prefab::new("/turf")]);
        assert!(map.set_tile_content(3, 1, 1, vec![]).is_none());
        assert!(map.set_tile_content(0, 1, 1, vec![]).is_none());
        assert!(map.set_tile_content(1, 1, 2, vec![]).is_none());
    }
}
