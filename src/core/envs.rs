//! Per-task environment variables.
//!
//! Every command a task runs receives the same variable set: the project's
//! user variables followed by identifiers the engine injects. Injected keys
//! win on collision. Host branches read the set while the pipeline may still
//! be adding to it, so the set is internally synchronized.

use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::project::Project;
use crate::task::ReleaseTask;
use crate::utils::parser;

pub const PROJECT_ID: &str = "PROJECT_ID";
pub const PROJECT_NAME: &str = "PROJECT_NAME";
pub const TASK_ID: &str = "TASK_ID";
pub const TASK_NAME: &str = "TASK_NAME";
pub const RELEASE_PATH: &str = "RELEASE_PATH";
pub const RELEASE_VERSION: &str = "RELEASE_VERSION";
pub const DEPLOY_PATH: &str = "DEPLOY_PATH";

#[derive(Debug, Default)]
pub struct EnvSet {
    vars: RwLock<IndexMap<String, String>>,
}

impl EnvSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let set = Self::new();
        for (key, value) in pairs {
            set.add(key, value);
        }
        set
    }

    /// Build from a `KEY=value` block, see [`parser::parse_key_values`].
    pub fn from_block(block: &str) -> Self {
        Self::from_pairs(parser::parse_key_values(block))
    }

    /// Insert or replace `key`. The key moves to the end of the order.
    pub fn add(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let mut vars = self.vars.write();
        vars.shift_remove(&key);
        vars.insert(key, value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.vars.read().get(key).cloned()
    }

    /// A new set holding only `keys` that are present, in `keys` order.
    pub fn pick(&self, keys: &[&str]) -> EnvSet {
        let vars = self.vars.read();
        let picked = EnvSet::new();
        for key in keys {
            if let Some(value) = vars.get(*key) {
                picked.add(*key, value.clone());
            }
        }
        picked
    }

    pub fn to_pairs(&self) -> Vec<(String, String)> {
        self.vars
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// `KEY=value` strings, the form stored on execution records.
    pub fn to_vec(&self) -> Vec<String> {
        self.vars
            .read()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        self.vars
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.vars.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.read().is_empty()
    }
}

impl Clone for EnvSet {
    fn clone(&self) -> Self {
        Self {
            vars: RwLock::new(self.vars.read().clone()),
        }
    }
}

/// Variables for a task: project user variables, then injected identifiers.
pub fn task_envs(project: &Project, task: &ReleaseTask) -> EnvSet {
    let envs = EnvSet::from_block(&project.task_vars);
    envs.add(PROJECT_ID, project.id.to_string());
    envs.add(PROJECT_NAME, project.name.clone());
    envs.add(TASK_ID, task.id.to_string());
    envs.add(TASK_NAME, task.name.clone());
    envs.add(RELEASE_PATH, project.target_root.clone());
    envs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn injected_keys_override_user_keys() {
        let envs = EnvSet::from_block("TASK_ID=spoofed\nAPP_ENV=prod\n# COMMENT=1");
        envs.add(TASK_ID, "42");

        assert_eq!(envs.get(TASK_ID).as_deref(), Some("42"));
        assert_eq!(envs.to_vec(), vec!["APP_ENV=prod", "TASK_ID=42"]);
    }

    #[test]
    fn pick_keeps_requested_subset() {
        let envs = EnvSet::from_pairs([("A", "1"), ("B", "2"), ("C", "3")]);
        let picked = envs.pick(&["C", "A", "MISSING"]);
        assert_eq!(picked.to_vec(), vec!["C=3", "A=1"]);
        assert_eq!(envs.len(), 3);
    }

    #[test]
    fn to_map_matches_pairs() {
        let envs = EnvSet::from_pairs([("A", "1"), ("B", "2")]);
        let map = envs.to_map();
        assert_eq!(map.get("B").map(String::as_str), Some("2"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn concurrent_readers_and_writer() {
        let envs = Arc::new(EnvSet::from_pairs([("BASE", "1")]));
        let mut handles = Vec::new();
        for i in 0..4 {
            let envs = Arc::clone(&envs);
            handles.push(std::thread::spawn(move || {
                for j in 0..200 {
                    if i == 0 {
                        envs.add(format!("K{}", j), j.to_string());
                    } else {
                        assert!(envs.to_vec().iter().any(|kv| kv == "BASE=1"));
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(envs.len(), 201);
    }
}
