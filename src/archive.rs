use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

const DEFAULT_EXT: &str = "lpp";

/// `<root>/<category>/<symbol>/<setting_id>.<ext>`, with the extension taken
/// from the source file.
pub fn archive_path(root: &Path, category: &str, symbol: &str, setting_id: i64, source: &Path) -> PathBuf {
    let ext = source
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .unwrap_or(DEFAULT_EXT);
    root.join(category)
        .join(symbol)
        .join(format!("{}.{}", setting_id, ext))
}

/// Copy an ingested source next to the files of the same setting, replacing
/// any earlier copy for that setting id.
pub fn store_copy(
    root: &Path,
    category: &str,
    symbol: &str,
    setting_id: i64,
    source: &Path,
) -> Result<PathBuf> {
    let dest = archive_path(root, category, symbol, setting_id, source);
    if let Some(dir) = dest.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }
    std::fs::copy(source, &dest)
        .with_context(|| format!("Failed to copy {:?} to {:?}", source, dest))?;
    debug!(dest = %dest.display(), "archived source");
    Ok(dest)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_layout() {
        let p = archive_path(Path::new("/data"), "lpp", "84Se", 7, Path::new("run/x.lpp"));
        assert_eq!(p, PathBuf::from("/data/lpp/84Se/7.lpp"));
    }

    #[test]
    fn extension_follows_source() {
        let p = archive_path(Path::new("a"), "c", "84Se", 1, Path::new("x.txt"));
        assert_eq!(p, PathBuf::from("a/c/84Se/1.txt"));
        let p = archive_path(Path::new("a"), "c", "84Se", 1, Path::new("noext"));
        assert_eq!(p, PathBuf::from("a/c/84Se/1.lpp"));
    }

    #[test]
    fn copy_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.lpp");
        std::fs::write(&src, "first").unwrap();

        let root = dir.path().join("archive");
        let dest = store_copy(&root, "lpp", "84Se", 3, &src).unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "first");

        std::fs::write(&src, "second").unwrap();
        let again = store_copy(&root, "lpp", "84Se", 3, &src).unwrap();
        assert_eq!(again, dest);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "second");
        assert_eq!(std::fs::read_dir(dest.parent().unwrap()).unwrap().count(), 1);
    }
}
