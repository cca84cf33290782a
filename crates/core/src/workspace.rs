//! Scratch directory layout owned by the active pipeline run.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::PipelineError;

const IMG_IN_DIR: &str = "img_in";
const IMG_OUT_DIR: &str = "img_out";
const PREVIEW_DIR: &str = "preview";
const PREVIEW_OUT_DIR: &str = "preview_out";
const TEMP_DIR: &str = "temp";

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staging area for full-run inputs.
    pub fn img_in(&self) -> PathBuf {
        self.root.join(IMG_IN_DIR)
    }

    /// Staging area for full-run outputs before postprocessing.
    pub fn img_out(&self) -> PathBuf {
        self.root.join(IMG_OUT_DIR)
    }

    pub fn preview(&self) -> PathBuf {
        self.root.join(PREVIEW_DIR)
    }

    pub fn preview_out(&self) -> PathBuf {
        self.root.join(PREVIEW_OUT_DIR)
    }

    /// Full-resolution snapshot used by whole-image previews.
    pub fn temp(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    fn all_dirs(&self) -> [PathBuf; 5] {
        [
            self.img_in(),
            self.img_out(),
            self.preview(),
            self.preview_out(),
            self.temp(),
        ]
    }

    pub fn ensure_dirs(&self) -> Result<(), PipelineError> {
        for dir in self.all_dirs() {
            fs::create_dir_all(&dir)
                .map_err(|e| PipelineError::io(format!("creating {}", dir.display()), e))?;
        }
        Ok(())
    }

    pub fn clear_all(&self) -> Result<(), PipelineError> {
        for dir in self.all_dirs() {
            clear_dir(&dir)?;
        }
        Ok(())
    }

    pub fn clear_preview(&self) -> Result<(), PipelineError> {
        for dir in [self.preview(), self.preview_out(), self.temp()] {
            clear_dir(&dir)?;
        }
        Ok(())
    }

    pub fn clear_full(&self) -> Result<(), PipelineError> {
        for dir in [self.img_in(), self.img_out()] {
            clear_dir(&dir)?;
        }
        Ok(())
    }

    pub fn is_preview_scratch_empty(&self) -> Result<bool, PipelineError> {
        for dir in [self.preview(), self.preview_out(), self.temp()] {
            if !is_dir_empty(&dir)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn is_full_scratch_empty(&self) -> Result<bool, PipelineError> {
        Ok(is_dir_empty(&self.img_in())? && is_dir_empty(&self.img_out())?)
    }
}

/// Removes everything inside `dir`, creating it if missing.
pub fn clear_dir(dir: &Path) -> Result<(), PipelineError> {
    if !dir.exists() {
        return fs::create_dir_all(dir)
            .map_err(|e| PipelineError::io(format!("creating {}", dir.display()), e));
    }

    let entries =
        fs::read_dir(dir).map_err(|e| PipelineError::io(format!("reading {}", dir.display()), e))?;
    for entry in entries {
        let path = entry
            .map_err(|e| PipelineError::io(format!("reading {}", dir.display()), e))?
            .path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|e| PipelineError::io(format!("removing {}", path.display()), e))?;
    }
    debug!(dir = %dir.display(), "Cleared scratch directory");
    Ok(())
}

/// A missing directory counts as empty.
pub fn is_dir_empty(dir: &Path) -> Result<bool, PipelineError> {
    match fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(PipelineError::io(format!("reading {}", dir.display()), e)),
    }
}

/// Copies `source` into `dir`, keeping its file name.
pub fn copy_into(source: &Path, dir: &Path) -> Result<PathBuf, PipelineError> {
    let target = target_in(source, dir)?;
    fs::copy(source, &target).map_err(|e| {
        PipelineError::io(
            format!("copying {} to {}", source.display(), target.display()),
            e,
        )
    })?;
    Ok(target)
}

/// Moves `source` into `dir`, keeping its file name. Falls back to copy and
/// delete when a rename is not possible (e.g. across file systems).
pub fn move_into(source: &Path, dir: &Path) -> Result<MovedFile, PipelineError> {
    let target = target_in(source, dir)?;
    move_file(source, &target)?;
    Ok(MovedFile {
        original: source.to_path_buf(),
        staged: target,
    })
}

fn target_in(source: &Path, dir: &Path) -> Result<PathBuf, PipelineError> {
    let name = source.file_name().ok_or_else(|| {
        PipelineError::io(
            format!("staging {}", source.display()),
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"),
        )
    })?;
    Ok(dir.join(name))
}

fn move_file(from: &Path, to: &Path) -> Result<(), PipelineError> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    let context = || format!("moving {} to {}", from.display(), to.display());
    fs::copy(from, to).map_err(|e| PipelineError::io(context(), e))?;
    fs::remove_file(from).map_err(|e| PipelineError::io(context(), e))
}

/// A source file moved into a staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovedFile {
    pub original: PathBuf,
    pub staged: PathBuf,
}

impl MovedFile {
    /// Moves the file back to its original location if that location is
    /// still free. Returns whether anything was moved.
    pub fn restore(&self) -> Result<bool, PipelineError> {
        if !self.staged.exists() {
            return Ok(false);
        }
        if self.original.exists() {
            warn!(
                original = %self.original.display(),
                "Original location is occupied, leaving staged copy in place"
            );
            return Ok(false);
        }
        move_file(&self.staged, &self.original)?;
        debug!(original = %self.original.display(), "Restored moved source file");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_and_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = Workspace::new(dir.path());
        ws.ensure_dirs().expect("ensure");
        fs::write(ws.preview().join("a.png"), b"x").expect("write");
        fs::create_dir_all(ws.preview_out().join("nested")).expect("mkdir");
        fs::write(ws.img_in().join("b.png"), b"x").expect("write");

        assert!(!ws.is_preview_scratch_empty().expect("check"));
        ws.clear_preview().expect("clear preview");
        assert!(ws.is_preview_scratch_empty().expect("check"));
        assert!(!ws.is_full_scratch_empty().expect("check"));

        ws.clear_all().expect("clear all");
        assert!(ws.is_full_scratch_empty().expect("check"));
    }

    #[test]
    fn test_clear_creates_missing_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("fresh");
        clear_dir(&target).expect("clear");
        assert!(target.is_dir());
        assert!(is_dir_empty(&dir.path().join("missing")).expect("empty"));
    }

    #[test]
    fn test_copy_keeps_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("photo.jpg");
        fs::write(&src, b"jpeg").expect("write");
        let staging = dir.path().join("stage");
        fs::create_dir_all(&staging).expect("mkdir");

        let copied = copy_into(&src, &staging).expect("copy");
        assert_eq!(copied, staging.join("photo.jpg"));
        assert!(src.exists());
        assert_eq!(fs::read(copied).expect("read"), b"jpeg");
    }

    #[test]
    fn test_move_and_restore() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("photo.png");
        fs::write(&src, b"png").expect("write");
        let staging = dir.path().join("stage");
        fs::create_dir_all(&staging).expect("mkdir");

        let moved = move_into(&src, &staging).expect("move");
        assert!(!src.exists());
        assert!(moved.staged.exists());

        assert!(moved.restore().expect("restore"));
        assert!(src.exists());
        assert!(!moved.staged.exists());
        assert!(!moved.restore().expect("second restore is a no-op"));
    }

    #[test]
    fn test_restore_does_not_clobber() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("photo.png");
        fs::write(&src, b"old").expect("write");
        let staging = dir.path().join("stage");
        fs::create_dir_all(&staging).expect("mkdir");

        let moved = move_into(&src, &staging).expect("move");
        fs::write(&src, b"new").expect("write replacement");
        assert!(!moved.restore().expect("restore"));
        assert_eq!(fs::read(&src).expect("read"), b"new");
    }

    #[test]
    fn test_copy_missing_source_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = copy_into(&dir.path().join("ghost.png"), dir.path()).expect_err("missing");
        assert!(matches!(err, PipelineError::Io { .. }));
    }
}
