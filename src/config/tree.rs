//! Hierarchical configuration tree
//!
//! A dotted-path view over a merged TOML table. Detection-engine tunables are
//! read through this tree rather than through typed structs so that missing or
//! malformed leaves can fall back per option instead of failing the whole file.

use crate::config::ConfigError;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use toml::{Table, Value};
use tracing::{debug, info};

/// Maximum nesting of `include` directives
const MAX_INCLUDE_DEPTH: usize = 8;

/// Configuration tree backed by a TOML table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfTree {
    root: Table,
}

impl ConfTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a tree from a TOML document, ignoring `include` directives
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let root: Table = toml::from_str(source)?;
        Ok(Self { root })
    }

    /// Load a tree from a file, following `include` directives
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_file_at_depth(path.as_ref(), 0)
    }

    fn load_file_at_depth(path: &Path, depth: usize) -> Result<Self, ConfigError> {
        if depth > MAX_INCLUDE_DEPTH {
            return Err(ConfigError::IncludeDepth(path.to_path_buf()));
        }

        let source: String = std::fs::read_to_string(path)?;
        let mut tree: ConfTree = Self::from_toml_str(&source)?;

        let includes: Vec<String> = tree.include_list();
        let base_dir: PathBuf = path.parent().map(Path::to_path_buf).unwrap_or_default();

        for include in includes {
            let include_path: PathBuf = base_dir.join(&include);
            info!("Including configuration file {}", include_path.display());
            let included: ConfTree = Self::load_file_at_depth(&include_path, depth + 1)?;
            tree.merge(included);
        }

        Ok(tree)
    }

    /// `include` accepts a single string or an array of strings
    fn include_list(&self) -> Vec<String> {
        match self.root.get("include") {
            Some(Value::String(file)) => vec![file.clone()],
            Some(Value::Array(files)) => files
                .iter()
                .filter_map(|v: &Value| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Merge another tree into this one; keys from `other` win
    pub fn merge(&mut self, other: ConfTree) {
        merge_tables(&mut self.root, other.root);
    }

    /// Look up any node by dotted path
    pub fn node(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first: &str = parts.next()?;
        let mut current: &Value = self.root.get(first)?;

        for part in parts {
            current = current.as_table()?.get(part)?;
        }

        Some(current)
    }

    /// Read a leaf as a string. Numbers and booleans are rendered in decimal /
    /// `true`/`false` form; tables and arrays are not leaves.
    pub fn get(&self, path: &str) -> Option<String> {
        match self.node(path)? {
            Value::String(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Boolean(b) => Some(b.to_string()),
            Value::Datetime(dt) => Some(dt.to_string()),
            Value::Array(_) | Value::Table(_) => None,
        }
    }

    /// Read a leaf as a boolean
    pub fn get_bool(&self, path: &str) -> Option<bool> {
        let value: String = self.get(path)?;
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "yes" | "true" | "on" => Some(true),
            "0" | "no" | "false" | "off" => Some(false),
            other => {
                debug!("Value \"{}\" at {} is not a boolean", other, path);
                None
            }
        }
    }

    /// Set a value at a dotted path, creating intermediate tables
    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        let parts: Vec<&str> = path.split('.').collect();
        let Some((leaf, parents)) = parts.split_last() else {
            return;
        };

        let mut table: &mut Table = &mut self.root;
        for part in parents {
            let entry: &mut Value = table
                .entry(part.to_string())
                .or_insert_with(|| Value::Table(Table::new()));
            if !entry.is_table() {
                *entry = Value::Table(Table::new());
            }
            table = match entry {
                Value::Table(t) => t,
                _ => return,
            };
        }

        table.insert(leaf.to_string(), value.into());
    }

    /// Deserialize the whole tree into a typed structure
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        Ok(Value::Table(self.root.clone()).try_into()?)
    }

    /// Borrow the underlying table
    pub fn as_table(&self) -> &Table {
        &self.root
    }
}

fn merge_tables(into: &mut Table, from: Table) {
    for (key, value) in from {
        match (into.get_mut(&key), value) {
            (Some(Value::Table(existing)), Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                into.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_dotted_lookup_renders_leaves() {
        let tree: ConfTree = ConfTree::from_toml_str(
            r#"
            [detect-engine]
            profile = "high"
            inspection-recursion-limit = 10

            [detect-engine.custom-values]
            toclient_src_groups = 7
            "#,
        )
        .unwrap();

        assert_eq!(tree.get("detect-engine.profile").as_deref(), Some("high"));
        assert_eq!(tree.get("detect-engine.inspection-recursion-limit").as_deref(), Some("10"));
        assert_eq!(
            tree.get("detect-engine.custom-values.toclient_src_groups").as_deref(),
            Some("7")
        );
        assert_eq!(tree.get("detect-engine.custom-values"), None);
        assert_eq!(tree.get("detect-engine.missing"), None);
    }

    #[test]
    fn test_get_bool_accepts_yaml_style_words() {
        let mut tree: ConfTree = ConfTree::new();
        tree.set("engine.init-failure-fatal", "yes");
        assert_eq!(tree.get_bool("engine.init-failure-fatal"), Some(true));

        tree.set("engine.init-failure-fatal", false);
        assert_eq!(tree.get_bool("engine.init-failure-fatal"), Some(false));

        tree.set("engine.init-failure-fatal", "maybe");
        assert_eq!(tree.get_bool("engine.init-failure-fatal"), None);
    }

    #[test]
    fn test_include_merges_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let included_path = dir.path().join("extra.toml");
        let mut included = std::fs::File::create(&included_path).unwrap();
        writeln!(included, "[detect-engine]\nprofile = \"low\"").unwrap();

        let main_path = dir.path().join("norx.toml");
        let mut main = std::fs::File::create(&main_path).unwrap();
        writeln!(
            main,
            "include = \"extra.toml\"\n[detect-engine]\nprofile = \"high\"\nsgh-mpm-context = \"full\""
        )
        .unwrap();

        let tree: ConfTree = ConfTree::load_file(&main_path).unwrap();
        assert_eq!(tree.get("detect-engine.profile").as_deref(), Some("low"));
        assert_eq!(tree.get("detect-engine.sgh-mpm-context").as_deref(), Some("full"));
    }

    #[test]
    fn test_self_include_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.toml");
        std::fs::write(&path, "include = \"loop.toml\"\n").unwrap();

        let err = ConfTree::load_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::IncludeDepth(_)));
    }
}
