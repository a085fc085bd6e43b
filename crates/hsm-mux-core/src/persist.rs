//! Owner-only JSON files for cache backups.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufReader, BufWriter, Write},
    path::Path,
};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use fs2::FileExt;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{MuxError, MuxResult};

pub fn ensure_backup_dir(path: &Path) -> MuxResult<()> {
    fs::create_dir_all(path).map_err(MuxError::storage)?;
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(MuxError::storage)?;
    Ok(())
}

fn create_owner_only(path: &Path) -> MuxResult<File> {
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let file = options.open(path).map_err(MuxError::storage)?;
    #[cfg(unix)]
    file.set_permissions(fs::Permissions::from_mode(0o600))
        .map_err(MuxError::storage)?;
    Ok(file)
}

/// Writes `value` as pretty JSON while holding an exclusive lock on the file.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> MuxResult<()> {
    let file = create_owner_only(path)?;
    FileExt::lock_exclusive(&file).map_err(MuxError::storage)?;
    let mut writer = BufWriter::new(&file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(MuxError::storage)?;
    writer.flush().map_err(MuxError::storage)?;
    drop(writer);
    file.sync_all().map_err(MuxError::storage)?;
    FileExt::unlock(&file).map_err(MuxError::storage)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> MuxResult<T> {
    let file = File::open(path).map_err(MuxError::storage)?;
    FileExt::lock_shared(&file).map_err(MuxError::storage)?;
    let value = serde_json::from_reader(BufReader::new(&file)).map_err(MuxError::storage);
    FileExt::unlock(&file).map_err(MuxError::storage)?;
    value
}
