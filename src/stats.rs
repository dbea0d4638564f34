//! Memory accounting and directory enumeration for the `stats` command
//! (spec §6, "Stats JSON"; spec §4.3, `stats`).
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::key::Key;

/// Mirrors the original's `str(...)`-everywhere stats payload
/// (`dfs/df_server.py::get_stats`): memory figures are decimal-string JSON
/// values, not JSON integers.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub used: String,
    pub free: String,
    pub max: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigStats {
    pub root_path: String,
    pub max_memory: String,
}

/// `level`-gated stats payload: `0` is memory + config; `1` adds resident
/// keys with sizes; `2` adds every key currently persisted under
/// `root_path`, discovered by a directory walk.
pub fn build_stats(
    level: u8,
    used: usize,
    max: usize,
    root_path: &Path,
    loaded_keys: Vec<(Key, usize)>,
) -> Value {
    let mut stats = Map::new();
    stats.insert(
        "memory".into(),
        serde_json::to_value(MemoryStats {
            used: used.to_string(),
            // used can exceed max: it sums two independently-admitted caches,
            // and a tabular entry's deep footprint can outgrow its admitted claim.
            free: max.saturating_sub(used).to_string(),
            max: max.to_string(),
        })
        .expect("MemoryStats serializes"),
    );
    stats.insert(
        "config".into(),
        serde_json::to_value(ConfigStats {
            root_path: root_path.display().to_string(),
            max_memory: max.to_string(),
        })
        .expect("ConfigStats serializes"),
    );
    if level >= 1 {
        let entries: Vec<Value> = loaded_keys
            .into_iter()
            .map(|(key, size)| Value::Array(vec![
                Value::Array(key.segments().iter().cloned().map(Value::String).collect()),
                Value::String(size.to_string()),
            ]))
            .collect();
        stats.insert("loaded_keys".into(), Value::Array(entries));
    }
    if level >= 2 {
        let all_keys: Vec<Value> = walk_keys(root_path)
            .into_iter()
            .map(|key| Value::Array(key.segments().iter().cloned().map(Value::String).collect()))
            .collect();
        stats.insert("all_keys".into(), Value::Array(all_keys));
    }
    Value::Object(stats)
}

/// Walks `root_path` and returns every regular file as a key path relative
/// to it, matching `dfs/df_server.py::get_all_key_paths`'s `os.walk`.
pub fn walk_keys(root_path: &Path) -> Vec<Key> {
    let mut keys = Vec::new();
    walk_into(root_path, root_path, &mut keys);
    keys
}

fn walk_into(root: &Path, dir: &Path, out: &mut Vec<Key>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_into(root, &path, out);
        } else if let Ok(relative) = path.strip_prefix(root) {
            let segments: Vec<String> = relative.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect();
            if let Ok(key) = Key::new(segments) {
                out.push(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn level_zero_has_only_memory_and_config() {
        let dir = tempdir().unwrap();
        let stats = build_stats(0, 0, 1024, dir.path(), vec![]);
        let obj = stats.as_object().unwrap();
        assert!(obj.contains_key("memory"));
        assert!(obj.contains_key("config"));
        assert!(!obj.contains_key("loaded_keys"));
        assert!(!obj.contains_key("all_keys"));
        assert_eq!(obj["memory"]["used"], "0");
        assert_eq!(obj["memory"]["free"], "1024");
        assert_eq!(obj["memory"]["max"], "1024");
    }

    #[test]
    fn level_one_adds_loaded_keys() {
        let dir = tempdir().unwrap();
        let key = Key::new(vec!["a".into(), "b".into()]).unwrap();
        let stats = build_stats(1, 10, 100, dir.path(), vec![(key, 10)]);
        let loaded = stats["loaded_keys"].as_array().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0][1], "10");
    }

    #[test]
    fn level_two_walks_the_directory() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("leaf"), b"x").unwrap();
        let stats = build_stats(2, 0, 100, dir.path(), vec![]);
        let all = stats["all_keys"].as_array().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], Value::Array(vec![Value::String("sub".into()), Value::String("leaf".into())]));
    }
}
