//! Writer for the `.dmm` format.
//!
//! Serialization is structure-preserving: given the baseline snapshot
//! taken when the map was opened, unchanged tiles keep the exact key they
//! had on disk, so version control diffs stay proportional to the edit.
//!
//! Key assignment for each cell, in raster order:
//!
//! 1. the baseline bound the same content at the same coordinate: keep it
//! 2. the baseline bound the same content anywhere: reuse that key
//! 3. otherwise: allocate the lowest key value no binding holds
//!
//! When allocation would overflow the key width, keys widen by one digit
//! and every line of the file changes. That is logged and deterministic.

use std::collections::{HashMap, HashSet};

use crate::environment::EnvironmentInfo;
use crate::preferences::{MapSaveMode, SavePreferences};

use super::{
    KEY_BASE, LineEnding, MapData, MapFormat, MapSize, Prefab, TGM_HEADER, TileContent, TileKey,
};

/// Serialize a map, diffing against `baseline` when one is given.
///
/// The baseline also decides the output layout and line endings under
/// [`MapSaveMode::Provided`]; without one the map diffs against itself,
/// which keeps every binding it already has.
pub fn serialize(
    data: &MapData,
    baseline: Option<&MapData>,
    env: Option<&EnvironmentInfo>,
    prefs: &SavePreferences,
) -> String {
    let base = baseline.unwrap_or(data);

    let format = match prefs.save_mode {
        MapSaveMode::Provided => base.format(),
        MapSaveMode::Byond => MapFormat::Byond,
        MapSaveMode::Tgm => MapFormat::Tgm,
    };
    let line_ending = base.line_ending();
    let nl = line_ending.as_str();

    let assignment = assign_keys(data, base, prefs.clean_unused_keys);
    let sanitize = prefs.sanitize_initial_vars;

    let mut out = String::new();

    if format == MapFormat::Tgm {
        out.push_str(base.header().or(data.header()).unwrap_or(TGM_HEADER));
        out.push_str(nl);
    }

    for (key, content) in &assignment.defs {
        render_definition(
            &mut out,
            *key,
            content,
            assignment.key_length,
            format,
            env,
            sanitize,
            nl,
        );
    }

    match format {
        MapFormat::Byond => render_byond_grid(&mut out, data.size(), &assignment, nl),
        MapFormat::Tgm => render_tgm_grid(&mut out, data.size(), &assignment, nl),
    }

    out
}

struct KeyAssignment<'a> {
    /// Output key per cell, raster order (x fastest, then y, then z)
    grid: Vec<TileKey>,
    /// Output definition table, sorted by key
    defs: Vec<(TileKey, &'a TileContent)>,
    key_length: u8,
}

fn assign_keys<'a>(data: &'a MapData, base: &'a MapData, clean_unused: bool) -> KeyAssignment<'a> {
    let mut key_length = base.key_length().max(data.key_length());
    let mut capacity = (KEY_BASE as u64).pow(key_length as u32);

    // Every baseline binding keeps its key, used or not, so nothing
    // already on disk gets relabeled underneath an unrelated edit
    let mut used: HashSet<TileKey> = base.defs().keys().copied().collect();
    let mut by_content: HashMap<&'a TileContent, TileKey> = HashMap::new();
    for (key, content) in base.defs() {
        by_content.entry(content).or_insert(*key);
    }

    let size = data.size();
    let mut grid = Vec::with_capacity(size.cells() as usize);
    let mut fresh: Vec<(TileKey, &'a TileContent)> = Vec::new();
    let mut next_free: u32 = 0;

    for z in 1..=size.z {
        for y in 1..=size.y {
            for x in 1..=size.x {
                let content = data
                    .tile_content(x, y, z)
                    .expect("grid keys always have a binding");

                let mut key = base
                    .tile_key(x, y, z)
                    .filter(|k| base.defs().get(k) == Some(content));
                if key.is_none() {
                    key = by_content.get(content).copied();
                }

                let key = key.unwrap_or_else(|| {
                    while used.contains(&TileKey(next_free)) {
                        next_free += 1;
                    }
                    if next_free as u64 >= capacity {
                        key_length += 1;
                        capacity = (KEY_BASE as u64).pow(key_length as u32);
                        log::warn!(
                            "tile key space exhausted while saving, widening keys to {key_length} characters"
                        );
                    }
                    let allocated = TileKey(next_free);
                    used.insert(allocated);
                    fresh.push((allocated, content));
                    allocated
                });

                if !by_content.contains_key(content) {
                    by_content.insert(content, key);
                }
                grid.push(key);
            }
        }
    }

    let mut defs: Vec<(TileKey, &'a TileContent)> = base
        .defs()
        .iter()
        .map(|(key, content)| (*key, content))
        .collect();
    defs.extend(fresh);
    if clean_unused {
        let referenced: HashSet<TileKey> = grid.iter().copied().collect();
        defs.retain(|(key, _)| referenced.contains(key));
    }
    defs.sort_by_key(|(key, _)| *key);

    KeyAssignment {
        grid,
        defs,
        key_length,
    }
}

/// Variables to write for a prefab, after optional sanitizing
fn visible_vars<'p>(
    prefab: &'p Prefab,
    env: Option<&EnvironmentInfo>,
    sanitize: bool,
) -> Vec<(&'p str, &'p str)> {
    prefab
        .vars
        .iter()
        .filter(|(name, value)| {
            !(sanitize && env.is_some_and(|e| e.is_initial_value(&prefab.path, name, value)))
        })
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn render_definition(
    out: &mut String,
    key: TileKey,
    content: &TileContent,
    width: u8,
    format: MapFormat,
    env: Option<&EnvironmentInfo>,
    sanitize: bool,
    nl: &str,
) {
    out.push('"');
    out.push_str(&key.encode(width));
    out.push_str("\" = (");

    match format {
        MapFormat::Byond => {
            for (i, prefab) in content.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render_prefab_byond(out, prefab, env, sanitize);
            }
        }
        MapFormat::Tgm if content.is_empty() => {}
        MapFormat::Tgm => {
            out.push_str(nl);
            for (i, prefab) in content.iter().enumerate() {
                render_prefab_tgm(out, prefab, env, sanitize, nl);
                if i + 1 < content.len() {
                    out.push(',');
                    out.push_str(nl);
                }
            }
        }
    }

    out.push(')');
    out.push_str(nl);
}

fn render_prefab_byond(out: &mut String, prefab: &Prefab, env: Option<&EnvironmentInfo>, sanitize: bool) {
    out.push_str(&prefab.path);
    let vars = visible_vars(prefab, env, sanitize);
    if vars.is_empty() {
        return;
    }
    out.push('{');
    for (i, (name, value)) in vars.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        out.push_str(name);
        out.push_str(" = ");
        out.push_str(value);
    }
    out.push('}');
}

fn render_prefab_tgm(
    out: &mut String,
    prefab: &Prefab,
    env: Option<&EnvironmentInfo>,
    sanitize: bool,
    nl: &str,
) {
    out.push_str(&prefab.path);
    let vars = visible_vars(prefab, env, sanitize);
    if vars.is_empty() {
        return;
    }
    out.push('{');
    out.push_str(nl);
    for (i, (name, value)) in vars.iter().enumerate() {
        out.push('\t');
        out.push_str(name);
        out.push_str(" = ");
        out.push_str(value);
        if i + 1 < vars.len() {
            out.push(';');
        }
        out.push_str(nl);
    }
    out.push_str("\t}");
}

/// Classic grid: one block per z-level, preceded by a blank line
fn render_byond_grid(out: &mut String, size: MapSize, assignment: &KeyAssignment<'_>, nl: &str) {
    for z in 1..=size.z {
        out.push_str(nl);
        out.push_str(&format!("(1,1,{z}) = {{\""));
        out.push_str(nl);
        for y in (1..=size.y).rev() {
            for x in 1..=size.x {
                let idx = (((z - 1) * size.y + (y - 1)) * size.x + (x - 1)) as usize;
                out.push_str(&assignment.grid[idx].encode(assignment.key_length));
            }
            out.push_str(nl);
        }
        out.push_str("\"}");
        out.push_str(nl);
    }
}

/// TGM grid: one single-column block per (x, z), blocks back to back
fn render_tgm_grid(out: &mut String, size: MapSize, assignment: &KeyAssignment<'_>, nl: &str) {
    out.push_str(nl);
    for z in 1..=size.z {
        for x in 1..=size.x {
            out.push_str(&format!("({x},1,{z}) = {{\""));
            out.push_str(nl);
            for y in (1..=size.y).rev() {
                let idx = (((z - 1) * size.y + (y - 1)) * size.x + (x - 1)) as usize;
                out.push_str(&assignment.grid[idx].encode(assignment.key_length));
                out.push_str(nl);
            }
            out.push_str("\"}");
            out.push_str(nl);
        }
    }
}
