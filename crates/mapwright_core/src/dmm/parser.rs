//! Parser for the `.dmm` format.
//!
//! Handles both layouts with one pass: tile definitions are collected
//! until their parens balance (classic defs close on one line, TGM defs
//! span several), and grid blocks are accepted at any block origin, so a
//! classic one-block-per-z file and a TGM one-block-per-column file
//! assemble into the same grid.

use std::fmt;

use indexmap::IndexMap;

use super::{
    KEY_BASE, LineEnding, MAX_CELLS, MapData, MapFormat, MapSize, Prefab, TileContent, TileKey,
};

/// Error from parsing a `.dmm` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// 1-based line the error was detected on. Errors about the file as
    /// a whole (missing coverage, no grid blocks) carry no line.
    pub line: Option<usize>,
    /// What went wrong
    pub message: String,
}

impl ParseError {
    fn at(line: usize, message: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            message: message.into(),
        }
    }

    fn whole_file(message: impl Into<String>) -> Self {
        Self {
            line: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse `.dmm` text into [`MapData`].
pub fn parse(src: &str) -> Result<MapData, ParseError> {
    let src = src.strip_prefix('\u{feff}').unwrap_or(src);
    let line_ending = if src.contains("\r\n") {
        LineEnding::CrLf
    } else {
        LineEnding::Lf
    };
    Parser {
        lines: src.lines().collect(),
        line_ending,
    }
    .run()
}

/// One `(x,y,z) = {"..."}` block, rows top to bottom
struct Block {
    x: u32,
    y: u32,
    z: u32,
    width: u32,
    rows: Vec<Vec<TileKey>>,
    /// 1-based header line, for error reporting
    line: usize,
}

struct Parser<'a> {
    lines: Vec<&'a str>,
    line_ending: LineEnding,
}

impl<'a> Parser<'a> {
    fn run(self) -> Result<MapData, ParseError> {
        let mut header: Option<String> = None;
        let mut defs: IndexMap<TileKey, TileContent> = IndexMap::new();
        let mut key_length: u8 = 0;
        let mut multiline_defs = false;
        let mut blocks: Vec<Block> = Vec::new();

        let mut i = 0;
        while i < self.lines.len() {
            let trimmed = self.lines[i].trim();
            if trimmed.is_empty() {
                i += 1;
                continue;
            }
            if trimmed.starts_with("//") {
                // Only the leading header comment is kept; BYOND strips
                // comments anywhere else
                if header.is_none() && defs.is_empty() && blocks.is_empty() {
                    header = Some(trimmed.to_string());
                }
                i += 1;
                continue;
            }
            if trimmed.starts_with('"') {
                if !blocks.is_empty() {
                    return Err(ParseError::at(i + 1, "tile definition after grid block"));
                }
                let (text, next) = self.collect_definition(i)?;
                multiline_defs |= next > i + 1;
                let (key, content) = parse_definition(&text, i + 1)?;
                match key_length {
                    0 => key_length = key.len() as u8,
                    n if n as usize != key.len() => {
                        return Err(ParseError::at(
                            i + 1,
                            format!("tile key \"{}\" has length {}, expected {}", key, key.len(), n),
                        ));
                    }
                    _ => {}
                }
                let decoded = TileKey::decode(&key)
                    .ok_or_else(|| ParseError::at(i + 1, format!("invalid tile key \"{key}\"")))?;
                if defs.insert(decoded, content).is_some() {
                    return Err(ParseError::at(i + 1, format!("duplicate tile key \"{key}\"")));
                }
                i = next;
                continue;
            }
            if trimmed.starts_with('(') {
                if key_length == 0 {
                    return Err(ParseError::at(i + 1, "grid block before any tile definition"));
                }
                let (block, next) = self.parse_block(i, key_length, &defs)?;
                blocks.push(block);
                i = next;
                continue;
            }
            return Err(ParseError::at(
                i + 1,
                format!("expected a tile definition or grid block, found \"{}\"", snippet(trimmed)),
            ));
        }

        self.assemble(header, defs, key_length, multiline_defs, blocks)
    }

    /// Gathers lines from `start` until the definition's parens balance.
    /// Returns the joined text and the index of the line after it.
    fn collect_definition(&self, start: usize) -> Result<(String, usize), ParseError> {
        let mut text = String::new();
        let mut depth = 0i32;
        let mut seen_open = false;
        let mut in_string: Option<char> = None;
        let mut escaped = false;

        let mut i = start;
        while i < self.lines.len() {
            let line = self.lines[i];
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(line);

            for ch in line.chars() {
                if let Some(quote) = in_string {
                    if escaped {
                        escaped = false;
                    } else if ch == '\\' {
                        escaped = true;
                    } else if ch == quote {
                        in_string = None;
                    }
                    continue;
                }
                match ch {
                    '"' | '\'' => in_string = Some(ch),
                    '(' => {
                        depth += 1;
                        seen_open = true;
                    }
                    ')' => {
                        depth -= 1;
                        if depth < 0 {
                            return Err(ParseError::at(i + 1, "unbalanced ')' in tile definition"));
                        }
                    }
                    _ => {}
                }
            }
            // Strings don't span lines in the dmm format
            escaped = false;

            if seen_open && depth == 0 && in_string.is_none() {
                return Ok((text, i + 1));
            }
            i += 1;
        }

        Err(ParseError::at(start + 1, "unterminated tile definition"))
    }

    /// Parses one grid block starting at `start` (the header line).
    /// Returns the block and the index of the line after its `"}`.
    fn parse_block(
        &self,
        start: usize,
        key_length: u8,
        defs: &IndexMap<TileKey, TileContent>,
    ) -> Result<(Block, usize), ParseError> {
        let header = self.lines[start].trim();
        let (x, y, z) = parse_block_coords(header, start + 1)?;

        let mut rows: Vec<Vec<TileKey>> = Vec::new();
        let mut width: u32 = 0;

        let mut i = start + 1;
        loop {
            let Some(&line) = self.lines.get(i) else {
                return Err(ParseError::at(start + 1, "unterminated grid block"));
            };
            if line.trim() == "\"}" {
                i += 1;
                break;
            }

            let row = line;
            if row.is_empty() {
                return Err(ParseError::at(i + 1, "empty grid row"));
            }
            if row.len() % key_length as usize != 0 {
                return Err(ParseError::at(
                    i + 1,
                    format!(
                        "grid row length {} is not a multiple of key length {}",
                        row.len(),
                        key_length
                    ),
                ));
            }
            let row_width = (row.len() / key_length as usize) as u32;
            if width == 0 {
                width = row_width;
            } else if row_width != width {
                return Err(ParseError::at(
                    i + 1,
                    format!("grid row is {row_width} tiles wide, expected {width}"),
                ));
            }

            let mut keys = Vec::with_capacity(row_width as usize);
            for chunk in row.as_bytes().chunks(key_length as usize) {
                let key = std::str::from_utf8(chunk).ok().and_then(TileKey::decode);
                let Some(key) = key else {
                    return Err(ParseError::at(
                        i + 1,
                        format!("invalid tile key \"{}\"", String::from_utf8_lossy(chunk)),
                    ));
                };
                if !defs.contains_key(&key) {
                    return Err(ParseError::at(
                        i + 1,
                        format!("tile key \"{}\" is not defined", String::from_utf8_lossy(chunk)),
                    ));
                }
                keys.push(key);
            }
            rows.push(keys);
            i += 1;
        }

        if rows.is_empty() || width == 0 {
            return Err(ParseError::at(start + 1, "empty grid block"));
        }

        Ok((
            Block {
                x,
                y,
                z,
                width,
                rows,
                line: start + 1,
            },
            i,
        ))
    }

    fn assemble(
        &self,
        header: Option<String>,
        defs: IndexMap<TileKey, TileContent>,
        key_length: u8,
        multiline_defs: bool,
        blocks: Vec<Block>,
    ) -> Result<MapData, ParseError> {
        if defs.is_empty() {
            return Err(ParseError::whole_file("map file contains no tile definitions"));
        }
        if blocks.is_empty() {
            return Err(ParseError::whole_file("map file contains no grid blocks"));
        }

        let mut size = MapSize::new(0, 0, 0);
        for block in &blocks {
            // Checked: a huge block origin must be a ParseError, not an
            // overflow. Coordinates are >= 1, so `x - 1` cannot wrap.
            let extent_x = (block.x - 1).checked_add(block.width);
            let extent_y = (block.y - 1).checked_add(block.rows.len() as u32);
            let (Some(extent_x), Some(extent_y)) = (extent_x, extent_y) else {
                return Err(ParseError::at(
                    block.line,
                    "grid block extends beyond the supported coordinate range",
                ));
            };
            size.x = size.x.max(extent_x);
            size.y = size.y.max(extent_y);
            size.z = size.z.max(block.z);
        }
        if size.cells() > MAX_CELLS {
            return Err(ParseError::whole_file(format!(
                "map dimensions {}x{}x{} exceed the supported size",
                size.x, size.y, size.z
            )));
        }

        let mut grid: Vec<Option<TileKey>> = vec![None; size.cells() as usize];
        for block in &blocks {
            let row_count = block.rows.len() as u32;
            for (row_idx, row) in block.rows.iter().enumerate() {
                // The first row of a block is its highest y coordinate
                let y = block.y + row_count - 1 - row_idx as u32;
                for (col, &key) in row.iter().enumerate() {
                    let x = block.x + col as u32;
                    let idx = (((block.z - 1) * size.y + (y - 1)) * size.x + (x - 1)) as usize;
                    grid[idx] = Some(key);
                }
            }
        }

        let mut resolved = Vec::with_capacity(grid.len());
        for (idx, cell) in grid.into_iter().enumerate() {
            let Some(key) = cell else {
                let plane = (size.x * size.y) as usize;
                let z = idx / plane + 1;
                let y = (idx % plane) / size.x as usize + 1;
                let x = (idx % plane) % size.x as usize + 1;
                return Err(ParseError::whole_file(format!(
                    "tile ({x},{y},{z}) is not covered by any grid block"
                )));
            };
            resolved.push(key);
        }

        let format = if header.is_some() || multiline_defs {
            MapFormat::Tgm
        } else {
            MapFormat::Byond
        };

        Ok(MapData::from_parts(
            size,
            resolved,
            defs,
            key_length,
            format,
            header,
            self.line_ending,
        ))
    }
}

/// Parses `(x,y,z) = {"` and validates the coordinates
fn parse_block_coords(header: &str, line: usize) -> Result<(u32, u32, u32), ParseError> {
    let malformed = || ParseError::at(line, format!("malformed grid block header \"{}\"", snippet(header)));

    let inner = header.strip_prefix('(').ok_or_else(malformed)?;
    let (coords, rest) = inner.split_once(')').ok_or_else(malformed)?;
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').ok_or_else(malformed)?;
    if rest.trim() != "{\"" {
        return Err(malformed());
    }

    let mut parts = coords.split(',').map(|part| part.trim().parse::<u32>());
    let (Some(Ok(x)), Some(Ok(y)), Some(Ok(z)), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };
    if x == 0 || y == 0 || z == 0 {
        return Err(ParseError::at(line, "grid coordinates are 1-based"));
    }
    Ok((x, y, z))
}

/// Parses a complete `"key" = (...)` definition.
/// Returns the raw key text and the prefab list.
fn parse_definition(text: &str, line: usize) -> Result<(String, TileContent), ParseError> {
    let rest = text
        .strip_prefix('"')
        .ok_or_else(|| ParseError::at(line, "expected tile definition to start with '\"'"))?;
    let (key, rest) = rest
        .split_once('"')
        .ok_or_else(|| ParseError::at(line, "missing closing '\"' in tile key"))?;

    let rest = rest.trim_start();
    let rest = rest
        .strip_prefix('=')
        .ok_or_else(|| ParseError::at(line, "expected '=' after tile key"))?;
    let content = rest.trim();
    let inner = content
        .strip_prefix('(')
        .and_then(|c| c.strip_suffix(')'))
        .ok_or_else(|| ParseError::at(line, "expected '(' ... ')' around tile content"))?;

    Ok((key.to_string(), parse_content(inner, line)?))
}

/// Splits tile content into prefabs at top-level commas
fn parse_content(inner: &str, line: usize) -> Result<TileContent, ParseError> {
    let mut prefabs = Vec::new();
    for piece in split_top_level(inner, ',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        prefabs.push(parse_prefab(piece, line)?);
    }
    Ok(prefabs)
}

fn parse_prefab(text: &str, line: usize) -> Result<Prefab, ParseError> {
    if !text.starts_with('/') {
        return Err(ParseError::at(
            line,
            format!("prefab path must start with '/', found \"{}\"", snippet(text)),
        ));
    }

    let (path, vars_text) = match find_top_level(text, '{') {
        Some(brace) => {
            let vars = text[brace + 1..]
                .trim_end()
                .strip_suffix('}')
                .ok_or_else(|| ParseError::at(line, "missing closing '}' in prefab"))?;
            (text[..brace].trim_end(), vars)
        }
        None => (text, ""),
    };

    if path.is_empty() || path.chars().any(char::is_whitespace) {
        return Err(ParseError::at(
            line,
            format!("malformed prefab path \"{}\"", snippet(path)),
        ));
    }

    let mut vars = IndexMap::new();
    for piece in split_top_level(vars_text, ';') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let (name, value) = split_var(piece)
            .ok_or_else(|| ParseError::at(line, format!("malformed variable \"{}\"", snippet(piece))))?;
        if vars.insert(name.to_string(), value.to_string()).is_some() {
            return Err(ParseError::at(line, format!("duplicate variable \"{name}\"")));
        }
    }

    Ok(Prefab {
        path: path.to_string(),
        vars,
    })
}

/// Splits `name = value`, keeping the value as a raw DM literal
fn split_var(piece: &str) -> Option<(&str, &str)> {
    let eq = find_top_level(piece, '=')?;
    let name = piece[..eq].trim();
    let value = piece[eq + 1..].trim();
    if name.is_empty() || value.is_empty() {
        return None;
    }
    let valid_name = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    valid_name.then_some((name, value))
}

/// Position of `target` at zero nesting depth, outside strings
fn find_top_level(text: &str, target: char) -> Option<usize> {
    let mut scan = NestScanner::default();
    for (idx, ch) in text.char_indices() {
        if scan.step(ch) && ch == target {
            return Some(idx);
        }
    }
    None
}

/// Splits at `separator` occurrences at zero nesting depth, outside strings
fn split_top_level(text: &str, separator: char) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut piece_start = 0;
    let mut scan = NestScanner::default();
    for (idx, ch) in text.char_indices() {
        if scan.step(ch) && ch == separator {
            pieces.push(&text[piece_start..idx]);
            piece_start = idx + ch.len_utf8();
        }
    }
    pieces.push(&text[piece_start..]);
    pieces
}

/// Tracks string and bracket nesting one character at a time.
/// `step` returns true when the character sits at top level.
#[derive(Default)]
struct NestScanner {
    depth: i32,
    in_string: Option<char>,
    escaped: bool,
}

impl NestScanner {
    fn step(&mut self, ch: char) -> bool {
        if let Some(quote) = self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if ch == '\\' {
                self.escaped = true;
            } else if ch == quote {
                self.in_string = None;
            }
            return false;
        }
        match ch {
            '"' | '\'' => {
                self.in_string = Some(ch);
                false
            }
            '(' | '{' | '[' => {
                // An opener sits at the level it opens from
                let top = self.depth == 0;
                self.depth += 1;
                top
            }
            ')' | '}' | ']' => {
                self.depth -= 1;
                false
            }
            _ => self.depth == 0,
        }
    }
}

fn snippet(text: &str) -> String {
    let mut out: String = text.chars().take(32).collect();
    if out.len() < text.len() {
        out.push_str("...");
    }
    out
}
