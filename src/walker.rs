//! File discovery for `know ingest`.
//!
//! Directories are walked recursively; each file's path relative to the
//! walked root is matched against the include and exclude globs. `.git`,
//! `target` and `node_modules` are always excluded. Paths given directly
//! as files are only checked against the excludes.

use std::path::PathBuf;

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Collect the files under `paths`, sorted and deduplicated.
pub fn collect_files(
    paths: &[PathBuf],
    include_globs: &[String],
    exclude_globs: &[String],
) -> Result<Vec<PathBuf>> {
    let include_set = if include_globs.is_empty() {
        build_globset(&["**/*".to_string()])?
    } else {
        build_globset(include_globs)?
    };
    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for root in paths {
        if root.is_file() {
            if !exclude_set.is_match(root) {
                files.push(root.clone());
            }
            continue;
        }
        if !root.is_dir() {
            bail!("path does not exist: {}", root.display());
        }
        for entry in WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            if exclude_set.is_match(relative) || !include_set.is_match(relative) {
                continue;
            }
            files.push(path.to_path_buf());
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
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
    use std::path::Path;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("docs/sub")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::write(root.join("docs/a.md"), "# A").unwrap();
        fs::write(root.join("docs/sub/b.txt"), "b").unwrap();
        fs::write(root.join("notes.md"), "n").unwrap();
        fs::write(root.join(".git/config"), "x").unwrap();
        fs::write(root.join("node_modules/pkg/readme.md"), "x").unwrap();
        tmp
    }

    fn names(root: &Path, files: &[PathBuf]) -> Vec<String> {
        files
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn test_walk_with_default_excludes() {
        let tmp = tree();
        let files = collect_files(&[tmp.path().to_path_buf()], &[], &[]).unwrap();
        assert_eq!(
            names(tmp.path(), &files),
            vec!["docs/a.md", "docs/sub/b.txt", "notes.md"]
        );
    }

    #[test]
    fn test_include_and_exclude_globs() {
        let tmp = tree();
        let files = collect_files(
            &[tmp.path().to_path_buf()],
            &["**/*.md".to_string()],
            &["docs/**".to_string()],
        )
        .unwrap();
        assert_eq!(names(tmp.path(), &files), vec!["notes.md"]);
    }

    #[test]
    fn test_direct_file_and_missing_path() {
        let tmp = tree();
        let file = tmp.path().join("docs/sub/b.txt");
        let files = collect_files(&[file.clone(), file.clone()], &["**/*.md".into()], &[]).unwrap();
        assert_eq!(files, vec![file]);

        assert!(collect_files(&[tmp.path().join("missing")], &[], &[]).is_err());
    }
}
