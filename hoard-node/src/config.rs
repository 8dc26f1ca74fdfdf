//! Load node config from file and environment.
//!
//! File: `--config <path>`, else ~/.config/hoard/config.toml or
//! /etc/hoard/config.toml. Env overrides: HOARD_LISTEN_ADDR,
//! HOARD_STORAGE_ROOT, HOARD_BOOTSTRAP (comma-separated),
//! HOARD_ENCRYPTION_KEY (hex), HOARD_NAMESPACE.

use std::path::{Path, PathBuf};

use anyhow::Context;
use hoard_core::NodeConfig;

/// Load config: default, then config file (if present), then env vars.
/// An explicitly named file must exist and parse.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<NodeConfig> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |name| std::env::var(name).ok());
    Ok(c)
}

fn read_file(path: &Path) -> anyhow::Result<NodeConfig> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

/// Candidate files, most specific first.
fn search_paths(home: Option<PathBuf>) -> Vec<PathBuf> {
    home.map(|h| h.join(".config/hoard/config.toml"))
        .into_iter()
        .chain([PathBuf::from("/etc/hoard/config.toml")])
        .collect()
}

/// First existing candidate wins; a broken one is reported and skipped
/// in favor of the defaults, not the next candidate.
fn load_file() -> Option<NodeConfig> {
    let path = search_paths(std::env::var_os("HOME").map(PathBuf::from))
        .into_iter()
        .find(|p| p.exists())?;
    match read_file(&path) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %format!("{e:#}"), "ignoring config file");
            None
        }
    }
}

fn apply_env(c: &mut NodeConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("HOARD_LISTEN_ADDR") {
        c.listen_addr = s;
    }
    if let Some(s) = var("HOARD_STORAGE_ROOT") {
        c.storage_root = PathBuf::from(s);
    }
    if let Some(s) = var("HOARD_BOOTSTRAP") {
        c.bootstrap = s
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(s) = var("HOARD_ENCRYPTION_KEY") {
        c.encryption_key = Some(s);
    }
    if let Some(s) = var("HOARD_NAMESPACE") {
        c.namespace = Some(s);
    }
}
