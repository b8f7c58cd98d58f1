//! Candidate-solution extraction from a finished workspace.

use std::path::Path;
use std::time::SystemTime;

use tracing::debug;

/// Return the contents of the most recently modified source file with the
/// given extension, or `None` when the workspace holds no candidate.
///
/// The test harness file (`test_solution.*`) is never a candidate.
pub fn extract_solution(workspace: &Path, extension: &str) -> Option<String> {
    let mut newest: Option<(SystemTime, std::path::PathBuf)> = None;

    for entry in walkdir::WalkDir::new(workspace)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        if stem == "test_solution" {
            continue;
        }
        let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
            continue;
        };
        match newest {
            Some((best, _)) if best >= modified => {}
            _ => newest = Some((modified, path.to_path_buf())),
        }
    }

    let (_, path) = newest?;
    debug!(candidate = %path.display(), "extracted solution candidate");
    std::fs::read_to_string(path).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn empty_workspace_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(extract_solution(dir.path(), "py").is_none());
    }

    #[test]
    fn picks_newest_matching_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("old.py"), "old").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(dir.path().join("new.py"), "new").unwrap();
        assert_eq!(extract_solution(dir.path(), "py").as_deref(), Some("new"));
    }

    #[test]
    fn ignores_other_extensions_and_harness() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "text").unwrap();
        fs::write(dir.path().join("solution.py"), "code").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(dir.path().join("test_solution.py"), "harness").unwrap();
        assert_eq!(extract_solution(dir.path(), "py").as_deref(), Some("code"));
    }

    #[test]
    fn finds_files_in_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg/impl.py"), "nested").unwrap();
        assert_eq!(extract_solution(dir.path(), "py").as_deref(), Some("nested"));
    }
}
