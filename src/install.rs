//! Installing built artifacts into the install prefix.
//!
//! Each [`InstallRule`] names files in a dependency's extracted tree (the
//! last path component may contain `*` and `?`) and a directory below the
//! install root to copy them to. Directories are copied recursively.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;
use walkdir::WalkDir;

use crate::error::{BuildError, IoContext, Result};
use crate::manifest::InstallRule;

/// Apply `rules` for one dependency; returns every installed top-level path.
pub fn install_artifacts(
    source_dir: &Path,
    install_root: &Path,
    rules: &[InstallRule],
) -> Result<Vec<PathBuf>> {
    let mut installed = Vec::new();
    for rule in rules {
        let matches = resolve_sources(source_dir, &rule.from)?;
        if matches.is_empty() {
            return Err(BuildError::MissingArtifact {
                pattern: rule.from.clone(),
                dir: source_dir.to_path_buf(),
            });
        }

        let dest_dir = install_root.join(&rule.to);
        fs::create_dir_all(&dest_dir)
            .io_context(|| format!("creating '{}'", dest_dir.display()))?;

        for src in matches {
            let Some(file_name) = src.file_name() else {
                continue;
            };
            let dest = dest_dir.join(file_name);
            if src.is_dir() {
                copy_dir_recursive(&src, &dest)?;
            } else {
                fs::copy(&src, &dest).io_context(|| {
                    format!("copying '{}' to '{}'", src.display(), dest.display())
                })?;
            }
            info!("INSTALL: {} -> {}", src.display(), dest.display());
            installed.push(dest);
        }
    }
    Ok(installed)
}

/// Expand `pattern` (relative to `root`) into existing paths, sorted.
fn resolve_sources(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let pattern_path = Path::new(pattern);
    let last = pattern_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    if !last.contains(['*', '?']) {
        let path = root.join(pattern_path);
        return Ok(if path.exists() { vec![path] } else { Vec::new() });
    }

    let dir = match pattern_path.parent() {
        Some(parent) => root.join(parent),
        None => root.to_path_buf(),
    };
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in fs::read_dir(&dir).io_context(|| format!("reading '{}'", dir.display()))? {
        let entry = entry.io_context(|| format!("reading '{}'", dir.display()))?;
        if let Some(name) = entry.file_name().to_str() {
            if wildcard_match(last, name) {
                found.push(entry.path());
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Shell-style matching of `*` (any run) and `?` (one character).
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ni));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ni = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

/// Recursively copy a directory, preserving symlinks on Unix.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| {
            let context = format!("walking '{}'", src.display());
            BuildError::io(context, e.into())
        })?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .io_context(|| format!("creating '{}'", target.display()))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).io_context(|| {
                format!("copying '{}' to '{}'", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = fs::read_link(src).io_context(|| format!("reading link '{}'", src.display()))?;
    if dst.exists() || dst.is_symlink() {
        fs::remove_file(dst).io_context(|| format!("replacing '{}'", dst.display()))?;
    }
    std::os::unix::fs::symlink(&target, dst)
        .io_context(|| format!("creating symlink '{}'", dst.display()))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst)
        .map(|_| ())
        .io_context(|| format!("copying '{}' to '{}'", src.display(), dst.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rule(from: &str, to: &str) -> InstallRule {
        InstallRule {
            from: from.into(),
            to: to.into(),
        }
    }

    #[test]
    fn wildcard_matching() {
        assert!(wildcard_match("*.h", "lame.h"));
        assert!(wildcard_match("*.lib", "libmp3lame-static.lib"));
        assert!(wildcard_match("lib?.a", "libz.a"));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("a*b*c", "aXXbYYc"));
        assert!(!wildcard_match("*.h", "lame.c"));
        assert!(!wildcard_match("lib?.a", "libzz.a"));
        assert!(!wildcard_match("a*b", "aXXc"));
    }

    #[test]
    fn installs_matching_headers_and_libs() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("lame-3.99.5");
        let install = temp.path().join("build");
        fs::create_dir_all(src.join("include")).unwrap();
        fs::create_dir_all(src.join("output")).unwrap();
        fs::write(src.join("include/lame.h"), "h").unwrap();
        fs::write(src.join("include/lame.def"), "def").unwrap();
        fs::write(src.join("output/libmp3lame-static.lib"), "lib").unwrap();

        let installed = install_artifacts(
            &src,
            &install,
            &[rule("include/*.h", "include/lame"), rule("output/*.lib", "lib")],
        )
        .unwrap();

        assert_eq!(installed.len(), 2);
        assert!(install.join("include/lame/lame.h").is_file());
        assert!(!install.join("include/lame/lame.def").exists());
        assert!(install.join("lib/libmp3lame-static.lib").is_file());
    }

    #[test]
    fn installs_single_file_and_directory() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("pthreads-w32-2.9.1");
        let install = temp.path().join("build");
        fs::create_dir_all(src.join("headers/sys")).unwrap();
        fs::write(src.join("pthread.h"), "p").unwrap();
        fs::write(src.join("headers/sys/types.h"), "t").unwrap();

        install_artifacts(
            &src,
            &install,
            &[rule("pthread.h", "include"), rule("headers", "include")],
        )
        .unwrap();

        assert!(install.join("include/pthread.h").is_file());
        assert!(install.join("include/headers/sys/types.h").is_file());
    }

    #[test]
    fn no_match_is_missing_artifact() {
        let temp = TempDir::new().unwrap();
        let err = install_artifacts(temp.path(), &temp.path().join("out"), &[rule("*.lib", "lib")])
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingArtifact { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn copy_dir_preserves_symlinks() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(src.join("subdir")).unwrap();
        fs::write(src.join("libfoo.so.1"), "so").unwrap();
        fs::write(src.join("subdir/nested.txt"), "n").unwrap();
        std::os::unix::fs::symlink("libfoo.so.1", src.join("libfoo.so")).unwrap();

        copy_dir_recursive(&src, &dst).unwrap();

        assert!(dst.join("subdir/nested.txt").is_file());
        assert!(dst.join("libfoo.so").is_symlink());
        assert_eq!(
            fs::read_link(dst.join("libfoo.so")).unwrap().to_str().unwrap(),
            "libfoo.so.1"
        );
    }
}
