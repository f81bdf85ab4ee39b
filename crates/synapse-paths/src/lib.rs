use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use synapse_protocol::ProjectConfig;
use tracing::{debug, warn};

/// Rule flags carried by trie nodes. `INCLUDE` overrides `IGNORE`.
pub const FLAG_NONE: u8 = 0;
pub const FLAG_IGNORE: u8 = 1 << 0;
pub const FLAG_INCLUDE: u8 = 1 << 1;

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    flags: u8,
}

/// A radix-style trie keyed by path segments.
///
/// Lookup walks the target segment-by-segment; the most specific flagged
/// node encountered wins, and a walk that never reaches a flagged node
/// reports no flags.
#[derive(Debug, Default)]
pub struct RuleTrie {
    root: TrieNode,
}

impl RuleTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a trie from a project config's ignore/include lists.
    pub fn from_config(config: &ProjectConfig) -> Self {
        let mut trie = Self::new();
        for path in &config.ignored_paths {
            trie.insert(path, FLAG_IGNORE);
        }
        for path in &config.included_paths {
            trie.insert(path, FLAG_INCLUDE);
        }
        trie
    }

    /// O(segments) rule insertion.
    pub fn insert(&mut self, path: &str, flag: u8) {
        let mut current = &mut self.root;
        for segment in segments(Path::new(path)) {
            current = current.children.entry(segment).or_default();
        }
        current.flags |= flag;
    }

    /// O(segments) lookup returning the most specific flag set seen on the
    /// walk. Falling off the trie keeps the last flagged ancestor's rules.
    pub fn check(&self, path: &Path) -> u8 {
        let mut current = &self.root;
        let mut accumulated = FLAG_NONE;
        for segment in segments(path) {
            let Some(next) = current.children.get(&segment) else {
                break;
            };
            current = next;
            if current.flags != FLAG_NONE {
                accumulated = current.flags;
            }
        }
        accumulated
    }

    /// True when some INCLUDE entry lies strictly below `path`; the walk
    /// must stay open through `path` or the exception is unreachable.
    pub fn leads_to_include(&self, path: &Path) -> bool {
        let mut current = &self.root;
        for segment in segments(path) {
            let Some(next) = current.children.get(&segment) else {
                return false;
            };
            current = next;
        }
        subtree_has_include(current)
    }

    pub fn clear(&mut self) {
        self.root = TrieNode::default();
    }
}

fn subtree_has_include(node: &TrieNode) -> bool {
    node.children
        .values()
        .any(|child| child.flags & FLAG_INCLUDE != 0 || subtree_has_include(child))
}

fn segments(path: &Path) -> impl Iterator<Item = String> + '_ {
    path.components().filter_map(|component| match component {
        Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
        _ => None,
    })
}

/// Lexically normalise a path (resolve `.` and `..`) without touching the
/// filesystem; edit targets may not exist yet.
pub fn lexical_normal(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Per-project path authority: resolves project ids to roots, loads the
/// rule config, and answers sandbox/rule queries for tool targets.
#[derive(Debug, Clone)]
pub struct PathGuard {
    data_root: PathBuf,
}

impl PathGuard {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    fn config_path(&self, project_id: &str) -> PathBuf {
        self.data_root.join(project_id).join("config.json")
    }

    /// Resolve a project id to its source-tree root. Returns `None` when
    /// the id has no registered config and is not itself an existing path.
    pub fn resolve_project_root(&self, project_id: &str) -> Option<PathBuf> {
        if project_id.is_empty() {
            return None;
        }

        let config_path = self.config_path(project_id);
        if config_path.exists() {
            match fs::read_to_string(&config_path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| {
                    serde_json::from_str::<ProjectConfig>(&raw).map_err(anyhow::Error::from)
                }) {
                Ok(config) => {
                    let local = PathBuf::from(&config.local_path);
                    if !config.local_path.is_empty() && local.exists() {
                        return Some(local);
                    }
                }
                Err(error) => {
                    warn!(project_id, %error, "failed to parse project config");
                }
            }
        }

        // Last resort: treat the id as a raw path.
        let raw = PathBuf::from(project_id);
        if raw.exists() { Some(raw) } else { None }
    }

    /// Load the project's rule config; missing or corrupt files yield an
    /// unrestricted default.
    pub fn load_config(&self, project_id: &str) -> ProjectConfig {
        let config_path = self.config_path(project_id);
        match fs::read_to_string(&config_path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|error| {
                warn!(project_id, %error, "corrupt project config, using defaults");
                ProjectConfig::default()
            }),
            Err(_) => ProjectConfig::default(),
        }
    }

    /// Sandbox prefix check: the normalised absolute target must sit under
    /// the normalised absolute root. Comparison is case-insensitive to
    /// match platforms with case-preserving filesystems.
    pub fn is_safe_path(root: &Path, target: &Path) -> bool {
        if root.as_os_str().is_empty() {
            return false;
        }
        let root_abs = match absolute_normal(root) {
            Some(path) => path,
            None => return false,
        };
        let target_abs = match absolute_normal(target) {
            Some(path) => path,
            None => return false,
        };

        let root_str = root_abs.to_string_lossy().to_lowercase();
        let target_str = target_abs.to_string_lossy().to_lowercase();
        // Component-wise so /proj does not claim /proj-other.
        if !Path::new(&target_str).starts_with(Path::new(&root_str)) {
            warn!(
                root = %root_abs.display(),
                target = %target_abs.display(),
                "path escape blocked"
            );
            return false;
        }
        true
    }

    /// The full gate consulted before any tool touches `target`:
    /// sandbox prefix first, then the rule trie. Allowed iff not ignored,
    /// or ignored-but-included, or a bridge directory on the way to an
    /// include entry.
    pub fn is_path_allowed(&self, project_id: &str, target: &Path) -> bool {
        let Some(root) = self.resolve_project_root(project_id) else {
            return false;
        };
        if !Self::is_safe_path(&root, target) {
            return false;
        }

        let config = self.load_config(project_id);
        if config.ignored_paths.is_empty() {
            return true;
        }

        let root_abs = match absolute_normal(&root) {
            Some(path) => path,
            None => return false,
        };
        let target_abs = match absolute_normal(target) {
            Some(path) => path,
            None => return false,
        };
        let Ok(relative) = target_abs.strip_prefix(&root_abs) else {
            return false;
        };

        let trie = RuleTrie::from_config(&config);
        let flags = trie.check(relative);
        if flags & FLAG_IGNORE == 0 {
            return true;
        }
        if flags & FLAG_INCLUDE != 0 {
            return true;
        }
        let bridged = trie.leads_to_include(relative);
        if bridged {
            debug!(target = %relative.display(), "ignored directory kept open as bridge");
        }
        bridged
    }
}

fn absolute_normal(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    Some(lexical_normal(&absolute))
}
