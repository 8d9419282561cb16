//! Marker-tagged /etc/hosts editing.
//!
//! Every line this helper writes carries the trailing marker comment;
//! removal only ever targets marked lines, so the rest of the file is
//! preserved byte-for-byte. Content transformations are pure functions
//! over the file text, with thin read/write wrappers around them.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub const MARKER: &str = "# portsmith-dynamic-forward";

fn matches_entry(line: &str, ip: &str, hostname: &str) -> bool {
    line.contains(MARKER) && line.contains(hostname) && line.contains(ip)
}

/// Append `"ip hostname MARKER"` unless an equivalent tagged line already
/// exists. Returns `None` when the entry is already present.
pub fn append_entry(content: &str, ip: &str, hostname: &str) -> Option<String> {
    if content.split('\n').any(|line| matches_entry(line, ip, hostname)) {
        return None;
    }

    let mut updated = content.to_string();
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&format!("{ip} {hostname} {MARKER}\n"));
    Some(updated)
}

/// Delete every tagged line matching (ip, hostname), leaving all other
/// lines untouched.
pub fn strip_entry(content: &str, ip: &str, hostname: &str) -> String {
    content
        .split('\n')
        .filter(|line| !matches_entry(line, ip, hostname))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Delete every line carrying the marker. Returns the remaining content and
/// the number of removed lines.
pub fn strip_all(content: &str) -> (String, usize) {
    let mut removed = 0;
    let kept: Vec<&str> = content
        .split('\n')
        .filter(|line| {
            if line.contains(MARKER) {
                removed += 1;
                false
            } else {
                true
            }
        })
        .collect();
    (kept.join("\n"), removed)
}

pub fn add(hosts_path: &Path, ip: &str, hostname: &str) -> Result<()> {
    let content = fs::read_to_string(hosts_path)
        .with_context(|| format!("failed to read {}", hosts_path.display()))?;

    match append_entry(&content, ip, hostname) {
        Some(updated) => {
            fs::write(hosts_path, updated)
                .with_context(|| format!("failed to write {}", hosts_path.display()))?;
            println!("Added /etc/hosts entry: {hostname} -> {ip}");
        }
        None => println!("/etc/hosts entry already exists: {hostname} -> {ip}"),
    }
    Ok(())
}

pub fn remove(hosts_path: &Path, ip: &str, hostname: &str) -> Result<()> {
    let content = fs::read_to_string(hosts_path)
        .with_context(|| format!("failed to read {}", hosts_path.display()))?;

    fs::write(hosts_path, strip_entry(&content, ip, hostname))
        .with_context(|| format!("failed to write {}", hosts_path.display()))?;
    println!("Removed /etc/hosts entry: {hostname} -> {ip}");
    Ok(())
}

pub fn remove_all(hosts_path: &Path) -> Result<()> {
    let content = fs::read_to_string(hosts_path)
        .with_context(|| format!("failed to read {}", hosts_path.display()))?;

    let (updated, removed) = strip_all(&content);
    if removed == 0 {
        println!("No portsmith /etc/hosts entries to remove");
        return Ok(());
    }

    fs::write(hosts_path, updated)
        .with_context(|| format!("failed to write {}", hosts_path.display()))?;
    println!("Removed {removed} /etc/hosts entries");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts_file(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn add_appends_marked_entry() {
        let (_dir, path) = hosts_file("127.0.0.1 localhost\n");

        add(&path, "127.0.0.2", "test.local").unwrap();

        let result = fs::read_to_string(&path).unwrap();
        assert!(result.contains("127.0.0.2 test.local"));
        assert!(result.contains(MARKER));
    }

    #[test]
    fn add_does_not_duplicate() {
        let (_dir, path) = hosts_file("127.0.0.1 localhost\n");

        add(&path, "127.0.0.2", "test.local").unwrap();
        add(&path, "127.0.0.2", "test.local").unwrap();

        let result = fs::read_to_string(&path).unwrap();
        assert_eq!(result.matches("127.0.0.2 test.local").count(), 1);
    }

    #[test]
    fn add_then_remove_restores_file_byte_for_byte() {
        let original = "127.0.0.1 localhost\n192.168.1.1 regular.host\n";
        let (_dir, path) = hosts_file(original);

        add(&path, "127.0.0.2", "test.local").unwrap();
        assert_ne!(fs::read_to_string(&path).unwrap(), original);

        remove(&path, "127.0.0.2", "test.local").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn remove_targets_only_the_given_pair() {
        let (_dir, path) = hosts_file(concat!(
            "127.0.0.1 localhost\n",
            "127.0.0.2 test.local # portsmith-dynamic-forward\n",
            "127.0.0.3 another.local # portsmith-dynamic-forward\n",
        ));

        remove(&path, "127.0.0.2", "test.local").unwrap();

        let result = fs::read_to_string(&path).unwrap();
        assert!(!result.contains("test.local"));
        assert!(result.contains("localhost"));
        assert!(result.contains("another.local"));
    }

    #[test]
    fn remove_all_strips_exactly_the_marked_lines() {
        let (_dir, path) = hosts_file(concat!(
            "127.0.0.1 localhost\n",
            "127.0.0.2 test.local # portsmith-dynamic-forward\n",
            "192.168.1.1 regular.host\n",
            "127.0.0.3 another.local # portsmith-dynamic-forward\n",
            "127.0.0.4 normal.host\n",
        ));

        remove_all(&path).unwrap();

        let result = fs::read_to_string(&path).unwrap();
        assert!(result.contains("127.0.0.1 localhost"));
        assert!(result.contains("192.168.1.1 regular.host"));
        assert!(result.contains("127.0.0.4 normal.host"));
        assert!(!result.contains("test.local"));
        assert!(!result.contains("another.local"));
    }

    #[test]
    fn remove_all_leaves_unmarked_file_unchanged() {
        let original = "127.0.0.1 localhost\n192.168.1.1 regular.host\n";
        let (_dir, path) = hosts_file(original);

        remove_all(&path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn append_entry_handles_missing_trailing_newline() {
        let updated = append_entry("127.0.0.1 localhost", "127.0.0.2", "test.local").unwrap();
        assert!(updated.starts_with("127.0.0.1 localhost\n"));
        assert!(updated.ends_with(&format!("127.0.0.2 test.local {MARKER}\n")));
    }
}
