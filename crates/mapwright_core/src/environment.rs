//! Environment information shared by the shell.
//!
//! Parsing a `.dme` object tree is the shell's job. The engine only needs
//! a digest of it: the environment's name and root directory, which type
//! paths exist, and the initial value each type gives a variable so saves
//! can drop overrides that restate defaults.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::dmm::MapData;

/// Digest of a parsed `.dme` environment
#[derive(Debug, Clone)]
pub struct EnvironmentInfo {
    name: String,
    root_dir: PathBuf,
    /// Type path -> initial variable literals, inheritance already flattened
    types: HashMap<String, HashMap<String, String>>,
}

impl EnvironmentInfo {
    /// New digest for the environment named `name` rooted at `root_dir`
    pub fn new(name: impl Into<String>, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root_dir: root_dir.into(),
            types: HashMap::new(),
        }
    }

    /// Environment name, typically the `.dme` file stem
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory the `.dme` lives in; map discovery walks from here
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Registers a type and the initial values of its variables
    pub fn register_type<I, K, V>(&mut self, path: impl Into<String>, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.types.insert(
            path.into(),
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
    }

    /// True when the environment declares the type path
    pub fn is_known_type(&self, path: &str) -> bool {
        self.types.contains_key(path)
    }

    /// Initial value literal for a variable on a type
    pub fn initial_value(&self, path: &str, var: &str) -> Option<&str> {
        self.types
            .get(path)
            .and_then(|vars| vars.get(var))
            .map(String::as_str)
    }

    /// True when `value` restates the type's initial value for `var`
    pub fn is_initial_value(&self, path: &str, var: &str, value: &str) -> bool {
        self.initial_value(path, var) == Some(value)
    }

    /// Type paths used anywhere in `data`'s definition table that this
    /// environment does not declare, sorted and deduplicated.
    ///
    /// A digest with no registered types reports nothing unknown, so
    /// shells that only fill in name and root don't drown in warnings.
    pub fn unknown_prefab_paths(&self, data: &MapData) -> Vec<String> {
        if self.types.is_empty() {
            return Vec::new();
        }
        let mut unknown = BTreeSet::new();
        for content in data.defs().values() {
            for prefab in content {
                if !self.is_known_type(&prefab.path) {
                    unknown.insert(prefab.path.clone());
                }
            }
        }
        unknown.into_iter().collect()
    }
}

/// Source of the currently-opened environment.
///
/// The session never caches the result: a map opened after an environment
/// switch sees the new one.
pub trait EnvironmentProvider: Send + Sync {
    /// The opened environment, if any
    fn opened_environment(&self) -> Option<Arc<EnvironmentInfo>>;
}

/// A fixed environment is itself a provider
impl EnvironmentProvider for Arc<EnvironmentInfo> {
    fn opened_environment(&self) -> Option<Arc<EnvironmentInfo>> {
        Some(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmm::parse;

    fn sample_env() -> EnvironmentInfo {
        let mut env = EnvironmentInfo::new("station", "/game");
        env.register_type("/turf/open/floor", [("dir", "2"), ("icon_state", "\"floor\"")]);
        env.register_type("/area/hall", Vec::<(&str, &str)>::new());
        env
    }

    #[test]
    fn initial_values_resolve_per_type() {
        let env = sample_env();
        assert_eq!(env.initial_value("/turf/open/floor", "dir"), Some("2"));
        assert!(env.is_initial_value("/turf/open/floor", "dir", "2"));
        assert!(!env.is_initial_value("/turf/open/floor", "dir", "4"));
        assert_eq!(env.initial_value("/turf/open/floor", "luminosity"), None);
        assert_eq!(env.initial_value("/obj/unknown", "dir"), None);
    }

    #[test]
    fn unknown_paths_are_sorted_and_deduplicated() {
        let env = sample_env();
        let map = parse(
            "\"a\" = (/obj/widget,/turf/open/floor,/area/hall)\n\"b\" = (/obj/widget,/obj/gadget,/area/hall)\n\n(1,1,1) = {\"\nab\n\"}\n",
        )
        .unwrap();
        assert_eq!(
            env.unknown_prefab_paths(&map),
            vec!["/obj/gadget".to_string(), "/obj/widget".to_string()]
        );
    }

    #[test]
    fn empty_digest_reports_nothing_unknown() {
        let env = EnvironmentInfo::new("station", "/game");
        let map = parse("\"a\" = (/obj/widget)\n\n(1,1,1) = {\"\na\n\"}\n").unwrap();
        assert!(env.unknown_prefab_paths(&map).is_empty());
    }
}
