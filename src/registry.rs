//! Plugin registry: discovery and enable/disable of plugin directories.
//!
//! The registry holds no state. Every call reads the plugins root afresh, so
//! results are never stale after a mutation.
//!
//! # What counts as a plugin
//!
//! A top-level entry of the plugins root is a plugin when it is a directory
//! (or a symlink to one), its name does not start with `.`, and it contains
//! at least one entry. Hidden directories are reserved for staging and trash
//! and are never reported. The enabled/disabled state comes from
//! [`crate::plugin::classify`].

use crate::error::{IoContext, PluginError, Result};
use crate::plugin::{classify, directory_name, PluginEntry, PluginState, PluginsRoot};
use crate::tree;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

/// Scans the plugins root and returns every plugin, sorted case-insensitively
/// by name.
///
/// A root that vanished yields an empty list; unreadable roots are an error.
pub fn scan(root: &PluginsRoot) -> Result<Vec<PluginEntry>> {
    let entries = match fs::read_dir(root.path()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(PluginError::io(
                format!("Failed to read plugins folder {:?}", root.path()),
                e,
            ))
        }
    };

    let mut by_name: HashMap<String, PluginEntry> = HashMap::new();

    for entry in entries {
        let entry = entry.with_path("Failed to read entry in", root.path())?;
        let path = entry.path();
        let dir_name = entry.file_name().to_string_lossy().to_string();

        if !looks_like_plugin(&path, &dir_name) {
            continue;
        }

        let (name, state) = classify(&dir_name);
        let plugin = PluginEntry {
            name: name.to_string(),
            path,
            state,
        };

        match by_name.get(name) {
            Some(existing) if existing.state == PluginState::Enabled => {
                tracing::warn!(
                    "Ignoring {:?}: plugin {:?} is also present enabled",
                    plugin.path,
                    name
                );
            }
            Some(existing) => {
                tracing::warn!(
                    "Ignoring {:?}: disabled twin of enabled plugin {:?}",
                    existing.path,
                    name
                );
                by_name.insert(name.to_string(), plugin);
            }
            None => {
                by_name.insert(name.to_string(), plugin);
            }
        }
    }

    let mut plugins: Vec<PluginEntry> = by_name.into_values().collect();
    plugins.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(plugins)
}

/// Looks up a plugin by name, in either state.
pub fn find(root: &PluginsRoot, name: &str) -> Result<PluginEntry> {
    for state in [PluginState::Enabled, PluginState::Disabled] {
        let path = root.plugin_path(name, state);
        if looks_like_plugin(&path, &directory_name(name, state)) {
            return Ok(PluginEntry {
                name: name.to_string(),
                path,
                state,
            });
        }
    }
    Err(PluginError::NotFound(format!("plugin {:?}", name)))
}

/// Moves a plugin into `state` with a single rename.
///
/// Requesting the state the plugin is already in is a no-op. Fails with
/// [`PluginError::NameCollision`] when the target directory is taken.
pub fn set_state(root: &PluginsRoot, entry: &PluginEntry, state: PluginState) -> Result<PluginEntry> {
    let current = root.plugin_path(&entry.name, entry.state);
    let target = root.plugin_path(&entry.name, state);

    let moved = PluginEntry {
        name: entry.name.clone(),
        path: target.clone(),
        state,
    };

    if !current.is_dir() {
        // Stale view of a plugin that is already where it should be.
        if target.is_dir() {
            return Ok(moved);
        }
        return Err(PluginError::NotFound(format!("plugin {:?}", entry.name)));
    }

    if entry.state == state {
        return Ok(moved);
    }

    if fs::symlink_metadata(&target).is_ok() {
        return Err(PluginError::NameCollision {
            name: directory_name(&entry.name, state),
            path: target,
        });
    }

    fs::rename(&current, &target).with_path("Failed to rename plugin folder to", &target)?;
    tracing::info!(plugin = %entry.name, "plugin {}", state);

    Ok(moved)
}

/// Relative paths of every file inside a plugin.
pub fn list_files(entry: &PluginEntry) -> Result<Vec<String>> {
    Ok(tree::walk(&entry.path)?
        .into_iter()
        .filter(|e| !e.is_dir)
        .map(|e| e.relative)
        .collect())
}

/// Applies the plugin heuristic documented at the module level.
pub fn looks_like_plugin(path: &Path, dir_name: &str) -> bool {
    if dir_name.starts_with('.') || !path.is_dir() {
        return false;
    }
    match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_some(),
        Err(e) => {
            tracing::warn!("Failed to read plugin folder {:?}: {}", path, e);
            false
        }
    }
}
