use crate::error::IngestError;
use std::path::{Path, PathBuf};

///
/// Recursively enumerate every file under `root` whose extension is `.csv` (case-insensitive).
/// Symbolic links are followed as the OS/filesystem presents them - no cycle detection is
/// attempted (§4.1).
///
pub fn discover_csv_files(root: &Path) -> Result<Vec<PathBuf>, IngestError> {
    log::debug!("discovering csv files under {}", root.display());
    if !root.is_dir() {
        return Err(IngestError::RootFolderMissing { path: root.to_string_lossy().into() });
    }

    let mut files = vec![];
    walk(root, &mut files)?;
    files.sort();
    log::info!("discovered {} csv file(s) under {}", files.len(), root.display());
    Ok(files)
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), IngestError> {
    log::debug!("scanning directory {}", dir.display());
    let entries = std::fs::read_dir(dir)
        .map_err(|source| IngestError::CannotReadDir { path: dir.to_string_lossy().into(), source })?;

    for entry in entries {
        let entry = entry.map_err(|source| IngestError::CannotReadDir { path: dir.to_string_lossy().into(), source })?;
        let path = entry.path();

        if path.is_dir() {
            walk(&path, files)?;
        } else if is_csv(&path) {
            files.push(path);
        }
    }

    Ok(())
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_root_is_fatal() {
        let result = discover_csv_files(Path::new("/no/such/folder/ever"));
        assert!(matches!(result, Err(IngestError::RootFolderMissing { .. })));
    }

    #[test]
    fn test_finds_nested_csv_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sales.csv"), "a,b\n1,2\n").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/SALES.CSV"), "a,b\n1,2\n").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "not a csv").unwrap();

        let found = discover_csv_files(dir.path()).unwrap();
        assert_eq!(2, found.len());
    }
}
