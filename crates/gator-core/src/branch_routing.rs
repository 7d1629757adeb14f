//! Branch routing: picks which upstream branch a fresh worktree bases off
//! of, keyed by the task's conventional-commit scope (the `type` or
//! `type(scope)` prefix of its name, e.g. `fix(api): ...` routes through
//! the `fix` entry).
//!
//! Consulted once per attempt in [`crate::attempt::FleetExecutor::execute`]
//! to resolve the `base_branch` passed to [`crate::worktree::WorktreeRegistry::acquire`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The `[branch_routing]` config-file section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchRoutingFileConfig {
    #[serde(default)]
    pub scope_map: HashMap<String, String>,
    pub default_branch: Option<String>,
    pub auto_rebase: Option<bool>,
    pub sdk_assisted_assessment: Option<bool>,
}

/// Resolved branch routing policy for this instance.
#[derive(Debug, Clone)]
pub struct BranchRouting {
    scope_map: HashMap<String, String>,
    default_branch: String,
    pub auto_rebase: bool,
    pub sdk_assisted_assessment: bool,
}

impl Default for BranchRouting {
    fn default() -> Self {
        Self {
            scope_map: HashMap::new(),
            default_branch: "origin/main".to_string(),
            auto_rebase: true,
            sdk_assisted_assessment: true,
        }
    }
}

impl BranchRouting {
    /// Resolve via env var > config-file section > built-in default.
    /// `BRANCH_ROUTING_SCOPE_MAP` follows the same `key:value,key:value`
    /// shape as `EXECUTORS`, e.g. `feat:origin/develop,fix:origin/main`.
    pub fn from_env_and_file(file: Option<&BranchRoutingFileConfig>) -> Self {
        let default = Self::default();

        let mut scope_map = file.map(|f| f.scope_map.clone()).unwrap_or_default();
        if let Ok(raw) = std::env::var("BRANCH_ROUTING_SCOPE_MAP") {
            scope_map.extend(parse_scope_map(&raw));
        }

        let default_branch = file
            .and_then(|f| f.default_branch.clone())
            .unwrap_or(default.default_branch);

        let auto_rebase = file.and_then(|f| f.auto_rebase).unwrap_or(default.auto_rebase);
        let sdk_assisted_assessment = file
            .and_then(|f| f.sdk_assisted_assessment)
            .unwrap_or(default.sdk_assisted_assessment);

        Self {
            scope_map,
            default_branch,
            auto_rebase,
            sdk_assisted_assessment,
        }
    }

    /// Pick the upstream branch for a task whose name carries a
    /// conventional-commit `type` or `type(scope)` prefix. Falls back to
    /// `default_branch` when the prefix doesn't match any configured scope,
    /// or the name has no recognizable prefix at all.
    pub fn base_branch_for(&self, task_name: &str) -> &str {
        match conventional_scope(task_name) {
            Some(scope) => self.scope_map.get(scope).map(String::as_str).unwrap_or(&self.default_branch),
            None => &self.default_branch,
        }
    }
}

fn parse_scope_map(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| entry.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Extract the conventional-commit `type` (ignoring an optional
/// `(scope)`) from a task name like `fix(api): handle timeout` or
/// `feat: add retry`. Returns `None` if there's no `:` before any
/// whitespace, i.e. the name doesn't look like a conventional commit.
fn conventional_scope(task_name: &str) -> Option<&str> {
    let prefix = task_name.split(':').next()?;
    if prefix == task_name || prefix.contains(char::is_whitespace) {
        return None;
    }
    let scope_type = prefix.split('(').next().unwrap_or(prefix);
    Some(scope_type.trim())
}
