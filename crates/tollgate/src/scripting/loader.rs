//! Script Loader (spec.md §4.2): discovers `.lua` files under a directory,
//! buckets them as global or tenant-scoped by filename, and compiles each to
//! bytecode under a bounded LRU so a hot reload doesn't recompile files that
//! haven't changed.

use crate::error::GatewayError;
use crate::scripting::types::ScriptArtifact;
use mlua::Lua;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

const GLOBAL_PREFIX: &str = "global-";
const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Bounded LRU: `order` holds ids most-recently-used at the back; eviction
/// pops the front. Kept as a plain `Vec` since `DEFAULT_CACHE_CAPACITY` is
/// small and this path is warm-up / reload only, not per-request.
struct CompileCache {
    capacity: usize,
    entries: HashMap<String, ScriptArtifact>,
    order: Vec<String>,
}

impl CompileCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn touch(&mut self, id: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == id) {
            self.order.remove(pos);
        }
        self.order.push(id.to_string());
    }

    fn insert(&mut self, artifact: ScriptArtifact) {
        let id = artifact.id.clone();
        self.entries.insert(id.clone(), artifact);
        self.touch(&id);
        while self.entries.len() > self.capacity {
            if self.order.is_empty() {
                break;
            }
            let evicted = self.order.remove(0);
            self.entries.remove(&evicted);
            warn!(script = %evicted, "evicted script from compile cache (capacity exceeded)");
        }
    }

    fn get(&mut self, id: &str) -> Option<&ScriptArtifact> {
        if self.entries.contains_key(id) {
            self.touch(id);
            self.entries.get(id)
        } else {
            None
        }
    }
}

/// Discovers, compiles, and caches scripts from a directory (spec.md §4.2).
pub struct ScriptLoader {
    dir: PathBuf,
    cache: CompileCache,
}

impl ScriptLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: CompileCache::new(DEFAULT_CACHE_CAPACITY),
        }
    }

    /// Walks `dir`, compiling every `.lua` file found. A missing directory
    /// is auto-created, not an error. A file that fails to parse is logged
    /// and omitted rather than aborting discovery of the rest.
    pub fn discover(&mut self) -> Result<(), GatewayError> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir).map_err(|e| {
                GatewayError::ConfigInvalid(format!(
                    "failed to create scripts_dir '{}': {e}",
                    self.dir.display()
                ))
            })?;
            return Ok(());
        }

        let lua = Lua::new();
        for entry in walkdir::WalkDir::new(&self.dir)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lua") {
                continue;
            }
            match compile_one(&lua, path) {
                Ok(artifact) => {
                    info!(script = %artifact.id, global = artifact.is_global, "loaded script");
                    self.cache.insert(artifact);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "script failed to parse, omitting");
                }
            }
        }
        Ok(())
    }

    /// Clears the cache and re-runs discovery (spec.md §4.2 `Reload`).
    pub fn reload(&mut self) -> Result<(), GatewayError> {
        self.cache = CompileCache::new(self.cache.capacity);
        self.discover()
    }

    pub fn get(&mut self, id: &str) -> Option<&ScriptArtifact> {
        self.cache.get(id)
    }

    pub fn global_ids(&self) -> Vec<String> {
        self.cache
            .entries
            .values()
            .filter(|a| a.is_global)
            .map(|a| a.id.clone())
            .collect()
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        self.cache
            .entries
            .values()
            .filter(|a| !a.is_global)
            .map(|a| a.id.clone())
            .collect()
    }
}

fn compile_one(lua: &Lua, path: &Path) -> Result<ScriptArtifact, GatewayError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_string();

    let (id, is_global) = match stem.strip_prefix(GLOBAL_PREFIX) {
        Some(trimmed) => (trimmed.to_string(), true),
        None => (stem, false),
    };

    let source = std::fs::read_to_string(path).map_err(|e| GatewayError::ScriptParseError {
        id: id.clone(),
        source: mlua::Error::RuntimeError(format!("failed to read {}: {e}", path.display())),
    })?;

    let bytecode = lua
        .load(&source)
        .set_name(&id)
        .into_function()
        .and_then(|f| f.dump(true))
        .map_err(|e| GatewayError::ScriptParseError {
            id: id.clone(),
            source: e,
        })?;

    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    let digest = hasher.finalize();
    let mut content_hash = [0u8; 8];
    content_hash.copy_from_slice(&digest[..8]);

    Ok(ScriptArtifact {
        id,
        source,
        bytecode,
        path: path.to_path_buf(),
        compiled_at: SystemTime::now(),
        content_hash,
        is_global,
    })
}
