use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Writes `data` to a temporary file next to `path` and renames it into
/// place, so readers only ever see the old or the new content. The file is
/// created owner read/write only.
pub fn write_rename(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}
