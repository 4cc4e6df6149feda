use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::VaultConfig;

/// One markdown file read from the vault.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Vault-relative path with `/` separators. Becomes the source key.
    pub rel_path: String,
    pub body: String,
    pub modified_at: DateTime<Utc>,
}

pub fn scan_vault(vault: &VaultConfig) -> Result<Vec<SourceFile>> {
    let root = &vault.root;
    if !root.exists() {
        bail!("Vault root does not exist: {}", root.display());
    }

    let include_set = build_globset(&vault.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/.obsidian/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(vault.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();

    let walker = WalkDir::new(root).follow_links(vault.follow_symlinks);
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = normalize(relative);

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }

        files.push(read_file(path, rel_str)?);
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

    Ok(files)
}

fn read_file(path: &Path, rel_path: String) -> Result<SourceFile> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let modified = metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);

    // Non-UTF-8 files are indexed as empty rather than failing the scan.
    let body = std::fs::read_to_string(path).unwrap_or_default();

    Ok(SourceFile {
        rel_path,
        body,
        modified_at: DateTime::<Utc>::from(modified),
    })
}

fn normalize(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn vault(root: &Path) -> VaultConfig {
        VaultConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*.md".to_string()],
            exclude_globs: vec!["drafts/**".to_string()],
            follow_symlinks: false,
        }
    }

    #[test]
    fn scan_applies_globs_and_sorts() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir_all(root.join("drafts")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("b.md"), "b").unwrap();
        fs::write(root.join("sub/a.md"), "a").unwrap();
        fs::write(root.join("drafts/x.md"), "x").unwrap();
        fs::write(root.join(".git/HEAD.md"), "x").unwrap();
        fs::write(root.join("notes.txt"), "x").unwrap();

        let files = scan_vault(&vault(root)).unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["b.md", "sub/a.md"]);
        assert_eq!(files[1].body, "a");
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(scan_vault(&vault(&tmp.path().join("nope"))).is_err());
    }
}
