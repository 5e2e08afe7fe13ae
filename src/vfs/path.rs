// # Path Resolution
//
// Lexical normalization plus the component-at-a-time walk from the
// system root: each step asks the current directory's filesystem to
// resolve one name, swaps v-node references as it descends, and crosses
// onto a mounted filesystem's root whenever the assembled path matches a
// mount point.

use crate::common::MAX_LOOKUP_DEPTH;
use crate::error::{Result, VfsError};
use crate::vfs::mount::{mount_lookup_by_path, mount_put, system_root_vnode};
use crate::vfs::vnode::{vnode_get, vnode_put, Vnode};
use std::sync::Arc;

/// Normalize an absolute path: collapse `.`, `..` (clamped at the
/// root), and repeated separators. Fails on relative paths.
pub fn normalize_path(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(VfsError::InvalidArgument(format!(
            "path {path:?} is not absolute"
        )));
    }

    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return Ok("/".to_string());
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Join a possibly relative path onto `base` (itself absolute)
pub fn join_path(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else if base == "/" {
        format!("/{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Split a normalized path into its parent and final component.
///
/// Fails on `/`, which has no parent entry.
pub fn split_parent(path: &str) -> Result<(String, String)> {
    let normalized = normalize_path(path)?;
    if normalized == "/" {
        return Err(VfsError::InvalidArgument("the root has no parent entry".into()));
    }
    match normalized.rfind('/') {
        Some(0) => Ok(("/".to_string(), normalized[1..].to_string())),
        Some(idx) => Ok((normalized[..idx].to_string(), normalized[idx + 1..].to_string())),
        None => Err(VfsError::InvalidArgument(format!("malformed path {normalized:?}"))),
    }
}

/// Resolve an absolute path to a counted v-node reference.
///
/// Interior components must be directories (`NotADirectory`); missing
/// entries surface the filesystem's `NotFound`; walks deeper than
/// [`MAX_LOOKUP_DEPTH`] fail with `TooManyLinks`.
pub fn lookup_absolute(path: &str) -> Result<Arc<Vnode>> {
    let normalized = normalize_path(path)?;
    let components: Vec<String> = normalized
        .split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();

    if components.len() > MAX_LOOKUP_DEPTH {
        return Err(VfsError::TooManyLinks(format!(
            "path depth {} exceeds {MAX_LOOKUP_DEPTH}",
            components.len()
        )));
    }

    let mut cur = system_root_vnode()?;
    let mut cur_path = "/".to_string();

    for comp in &components {
        if !cur.is_dir() {
            vnode_put(&cur)?;
            return Err(VfsError::NotADirectory(cur_path));
        }

        let step = resolve_component(&cur, comp);
        let next = match step {
            Ok(next) => next,
            Err(e) => {
                vnode_put(&cur)?;
                return Err(e);
            }
        };

        vnode_put(&cur)?;
        cur = next;

        cur_path = if cur_path == "/" {
            format!("/{comp}")
        } else {
            format!("{cur_path}/{comp}")
        };

        // Cross onto a filesystem mounted over this directory.
        if let Some(sub) = mount_lookup_by_path(&cur_path) {
            let subroot = sub.root_vnode();
            mount_put(&sub);
            if let Ok(root) = subroot {
                vnode_put(&cur)?;
                cur = root;
            }
        }
    }

    Ok(cur)
}

fn resolve_component(dir: &Arc<Vnode>, name: &str) -> Result<Arc<Vnode>> {
    let mnt = dir
        .mount()
        .ok_or_else(|| VfsError::ObjectReleased("v-node".into()))?;
    let sb = mnt.superblock()?;
    let dir_node = dir
        .fs_node()
        .ok_or_else(|| VfsError::ObjectReleased("v-node private".into()))?;

    let vnid = mnt.fs().ops().lookup(&sb, &dir_node, name)?;
    vnode_get(mnt.id(), vnid)
}

/// Resolve the parent directory of `path`, returning the directory's
/// counted v-node reference and the final component name.
pub fn lookup_parent(path: &str) -> Result<(Arc<Vnode>, String)> {
    let (parent, name) = split_parent(path)?;
    let dir = lookup_absolute(&parent)?;
    if !dir.is_dir() {
        vnode_put(&dir)?;
        return Err(VfsError::NotADirectory(parent));
    }
    Ok((dir, name))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_dots_and_slashes() {
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("//a//b/").unwrap(), "/a/b");
        assert_eq!(normalize_path("/a/./b").unwrap(), "/a/b");
        assert_eq!(normalize_path("/a/b/../c").unwrap(), "/a/c");
        assert_eq!(normalize_path("/../..").unwrap(), "/");
    }

    #[test]
    fn test_normalize_rejects_relative() {
        assert!(matches!(
            normalize_path("a/b"),
            Err(VfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/home", "file"), "/home/file");
        assert_eq!(join_path("/", "file"), "/file");
        assert_eq!(join_path("/home", "/etc/x"), "/etc/x");
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(
            split_parent("/a/b/c").unwrap(),
            ("/a/b".to_string(), "c".to_string())
        );
        assert_eq!(
            split_parent("/file").unwrap(),
            ("/".to_string(), "file".to_string())
        );
        assert!(split_parent("/").is_err());
    }
}
