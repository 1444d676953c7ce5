use std::fs;
use std::io;
use std::path::Path;

/// Creates `dir` and any missing parent. An existing directory is fine.
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    if !dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a directory", dir.display()),
        ));
    }
    Ok(())
}

/// Removes a file; a missing file is fine.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_dir_creates_nested_and_tolerates_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a/b/c");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        ensure_dir(&nested).unwrap();
    }

    #[test]
    fn ensure_dir_fails_below_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(ensure_dir(&file.join("sub")).is_err());
        assert!(ensure_dir(&file).is_err());
    }

    #[test]
    fn remove_if_exists_ignores_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("sock");
        remove_if_exists(&file).unwrap();
        fs::write(&file, b"").unwrap();
        remove_if_exists(&file).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn remove_if_exists_reports_directories() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(remove_if_exists(tmp.path()).is_err());
    }
}
