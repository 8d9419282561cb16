//! On-disk registry of aliases created by this helper.
//!
//! A newline-delimited list of loopback addresses under /var/run. Bulk
//! removal walks this registry rather than the interface, so loopback
//! aliases created by anything else are never touched.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Load the registered aliases. A missing file means an empty registry.
pub fn load(path: &Path) -> Result<Vec<String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).context("failed to read state file"),
    };

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Record an alias exactly once.
pub fn add(path: &Path, ip: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).context("failed to create state directory")?;
    }

    let aliases = load(path)?;
    if aliases.iter().any(|existing| existing == ip) {
        return Ok(());
    }

    let mut content = aliases.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    content.push_str(ip);
    content.push('\n');

    fs::write(path, content).context("failed to write state file")
}

/// Drop an alias from the registry.
pub fn remove(path: &Path, ip: &str) -> Result<()> {
    let aliases = load(path)?;
    let kept: Vec<String> = aliases.into_iter().filter(|existing| existing != ip).collect();

    let mut content = kept.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }

    fs::write(path, content).context("failed to write state file")
}

/// Empty the registry.
pub fn clear(path: &Path) -> Result<()> {
    fs::write(path, "").context("failed to clear state file")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("state").join("aliases")
    }

    #[test]
    fn missing_file_is_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&registry_path(&dir)).unwrap().is_empty());
    }

    #[test]
    fn add_records_each_alias_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = registry_path(&dir);

        add(&path, "127.0.0.2").unwrap();
        add(&path, "127.0.0.3").unwrap();
        add(&path, "127.0.0.2").unwrap();

        assert_eq!(load(&path).unwrap(), vec!["127.0.0.2", "127.0.0.3"]);
    }

    #[test]
    fn remove_drops_only_the_given_alias() {
        let dir = tempfile::tempdir().unwrap();
        let path = registry_path(&dir);

        add(&path, "127.0.0.2").unwrap();
        add(&path, "127.0.0.3").unwrap();
        remove(&path, "127.0.0.2").unwrap();

        assert_eq!(load(&path).unwrap(), vec!["127.0.0.3"]);
    }

    #[test]
    fn clear_empties_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = registry_path(&dir);

        add(&path, "127.0.0.2").unwrap();
        clear(&path).unwrap();

        assert!(load(&path).unwrap().is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }
}
