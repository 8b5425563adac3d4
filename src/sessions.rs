use std::path::PathBuf;

/// Answers "how many sessions are in flight right now". The deployer polls
/// this to find a safe restart point. Implementations must not block and
/// must not fail: no data means no sessions.
pub trait SessionSource: Send + Sync {
    fn active_count(&self) -> usize;
}

/// Marker-file convention: whatever runs sessions drops one file per live
/// session into the directory and removes it on the terminal event.
pub struct DirSessionSource {
    dir: PathBuf,
}

impl DirSessionSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SessionSource for DirSessionSource {
    fn active_count(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_dir_counts_zero() {
        let source = DirSessionSource::new("/tmp/warden-no-such-sessions-dir");
        assert_eq!(source.active_count(), 0);
    }

    #[test]
    fn test_empty_dir_counts_zero() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirSessionSource::new(dir.path());
        assert_eq!(source.active_count(), 0);
    }

    #[test]
    fn test_counts_marker_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a1b2.session"), "").unwrap();
        std::fs::write(dir.path().join("c3d4.session"), "").unwrap();
        // Subdirectories are not sessions
        std::fs::create_dir(dir.path().join("archive")).unwrap();

        let source = DirSessionSource::new(dir.path());
        assert_eq!(source.active_count(), 2);

        std::fs::remove_file(dir.path().join("a1b2.session")).unwrap();
        assert_eq!(source.active_count(), 1);
    }
}
