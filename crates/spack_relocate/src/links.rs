//! Symlink retargeting.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::{PrefixMap, RelocateError};

/// Rewrites the targets of absolute symlinks whose target starts with
/// a mapped prefix. Relative symlinks are untouched.
pub fn relocate_links(links: &[PathBuf], map: &PrefixMap) -> Result<(), RelocateError> {
    for path in links {
        let target = fs::read_link(path).map_err(|e| RelocateError::SymlinkRelocationFailure {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let Some(target_str) = target.to_str() else {
            continue;
        };
        let new_target = map.apply_to_str(target_str);
        if new_target == target_str {
            continue;
        }
        trace!(path = %path.display(), target = %new_target, "retargeting symlink");
        replace_symlink(path, Path::new(&new_target)).map_err(|e| {
            RelocateError::SymlinkRelocationFailure { path: path.clone(), reason: e.to_string() }
        })?;
    }
    Ok(())
}

#[cfg(unix)]
fn replace_symlink(path: &Path, target: &Path) -> std::io::Result<()> {
    fs::remove_file(path)?;
    std::os::unix::fs::symlink(target, path)
}

#[cfg(windows)]
fn replace_symlink(path: &Path, target: &Path) -> std::io::Result<()> {
    fs::remove_file(path)?;
    std::os::windows::fs::symlink_file(target, path)
}

#[cfg(all(unix, test))]
mod test {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn absolute_links_are_retargeted_and_relative_kept() {
        let dir = tempfile::tempdir().unwrap();
        let absolute = dir.path().join("absolute");
        let relative = dir.path().join("relative");
        symlink("/orig/opt/pkg/bin/app", &absolute).unwrap();
        symlink("app", &relative).unwrap();

        let mut map = PrefixMap::new();
        map.insert("/orig/opt/pkg", "/new/opt/pkg-xyz");
        relocate_links(&[absolute.clone(), relative.clone()], &map).unwrap();

        assert_eq!(
            fs::read_link(&absolute).unwrap(),
            Path::new("/new/opt/pkg-xyz/bin/app")
        );
        assert_eq!(fs::read_link(&relative).unwrap(), Path::new("app"));
    }
}
