//! The enlistment-local alternates pointer.
//!
//! `<git dir>/objects/info/alternates` holds exactly one line: the absolute
//! ObjectsRoot path, with no trailing newline or separator. It is replaced
//! atomically so a concurrent git reader sees either the old or the new path.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use vshare_config::path::persisted_form;

use crate::Result;

/// `<git dir>/objects/info/alternates`
pub fn alternates_path(git_dir: &Path) -> PathBuf {
    git_dir.join("objects").join("info").join("alternates")
}

/// Point `git_dir` at `objects_root`, replacing any previous pointer.
pub fn write_alternates(git_dir: &Path, objects_root: &Path) -> Result<()> {
    let path = alternates_path(git_dir);
    let parent = path.parent().unwrap_or(git_dir);
    fs::create_dir_all(parent)?;

    let contents = persisted_form(objects_root);
    let tmp_path = path.with_file_name(format!(
        "alternates.{}.{}.tmp",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));

    let written = (|| -> io::Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    debug!("Alternates at {:?} -> {}", path, contents);
    Ok(())
}

/// Current pointer contents, or `None` when the file does not exist
pub fn read_alternates(git_dir: &Path) -> Result<Option<String>> {
    match fs::read_to_string(alternates_path(git_dir)) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
