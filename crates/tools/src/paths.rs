//! Workspace path resolution and containment.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Lexically resolve `.` and `..` in a path *without* hitting the filesystem.
///
/// `canonicalize()` fails when the file (or its parents) don't exist yet, but
/// write targets still need to be checked against the workspace boundary.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// Why a path was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escape {
    /// `..` (or an absolute path) leaves the root before touching the disk.
    Lexical(PathBuf),
    /// An existing ancestor resolves through a symlink to somewhere outside.
    Symlink { path: PathBuf, resolved: PathBuf },
}

impl std::fmt::Display for Escape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Escape::Lexical(p) => write!(f, "{} is outside the workspace", p.display()),
            Escape::Symlink { path, resolved } => write!(
                f,
                "{} resolves through a symlink to {}, outside the workspace",
                path.display(),
                resolved.display()
            ),
        }
    }
}

/// Resolve `raw` against `root` and require it to stay inside.
///
/// `root` should already be canonical.  The check does not depend on whether
/// `raw` exists: the lexical form must stay under `root`, and the deepest
/// existing ancestor must canonicalize to somewhere under `root` as well.
pub fn contain(root: &Path, raw: &str) -> Result<PathBuf, Escape> {
    let root = normalize_path(root);
    let full = normalize_path(&root.join(raw));
    if !full.starts_with(&root) {
        return Err(Escape::Lexical(full));
    }

    let mut existing = full.as_path();
    loop {
        match existing.symlink_metadata() {
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::NotFound => match existing.parent() {
                Some(parent) => existing = parent,
                None => return Ok(full),
            },
            // Permission problems surface later as tool errors.
            Err(_) => return Ok(full),
        }
    }

    match existing.canonicalize() {
        Ok(resolved) if resolved.starts_with(&root) => Ok(full),
        Ok(resolved) => Err(Escape::Symlink {
            path: full,
            resolved,
        }),
        Err(_) => Err(Escape::Symlink {
            path: full.clone(),
            resolved: existing.to_path_buf(),
        }),
    }
}

/// Workspace-relative display form; `.` for the root itself.
pub fn relative_display(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => path.to_string_lossy().into_owned(),
    }
}
