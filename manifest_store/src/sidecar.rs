use std::fs::File;
use std::io::{ErrorKind, Write};
use std::path::Path;

use memmap2::Mmap;
use tempfile::NamedTempFile;

/// Sidecar file name for a key: lowercase hex of a 256-bit content-independent
/// digest of the (already key-encoded) key. Callers cannot influence it.
pub fn file_name(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

/// Write `bytes` to `data_dir/<name>` via a temp file under a fresh random
/// name, flushed and fsynced, then atomically renamed over the final path.
/// A previous sidecar with the same name is overwritten by the rename.
pub fn write(data_dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = NamedTempFile::new_in(data_dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(data_dir.join(name)).map_err(|e| e.error)?;
    Ok(())
}

/// Load a sidecar file fully, memory-mapped. Returns `None` when the file is
/// gone, so the caller can discard the orphaned manifest row.
pub fn read(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    if len == 0 {
        // mapping a zero-length file is an error on most platforms
        return Ok(Some(Vec::new()));
    }
    let map = unsafe { Mmap::map(&file)? };
    Ok(Some(map.to_vec()))
}

/// Remove a sidecar file, disregarding a "NotFound" error if it is already gone.
pub fn remove(path: &Path) -> std::io::Result<()> {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            return Err(e);
        }
    }
    Ok(())
}
