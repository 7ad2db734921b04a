use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::store::Storage;
use crate::{Error, Result};

const VALUE_EXT: &str = "kv";
const TEMP_EXT: &str = "kv.tmp";

/// Directory-backed storage: one file per key.
///
/// File names are the hex-encoded key, so keys may contain `/` and `:`.
/// Writes go to a temp file which is synced and renamed over the target.
/// Every write gets its own temp file, so concurrent writers to one key
/// never share a path; the last rename wins.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    closed: AtomicBool,
    temp_seq: AtomicU64,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        remove_stale_temps(&root)?;
        Ok(Self {
            root,
            closed: AtomicBool::new(false),
            temp_seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{VALUE_EXT}", encode_key(key)))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(
            "{}.{}.{seq}.{TEMP_EXT}",
            encode_key(key),
            std::process::id()
        ))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl Storage for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        match fs::read(self.value_path(key)) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_open()?;
        let path = self.value_path(key);
        let tmp = self.temp_path(key);
        let written = write_synced(&tmp, value).and_then(|()| fs::rename(&tmp, &path));
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        self.check_open()?;
        match fs::remove_file(self.value_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

fn write_synced(path: &Path, value: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)?;
    file.write_all(value)?;
    file.sync_all()
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() * 2);
    for byte in key.bytes() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn remove_stale_temps(root: &Path) -> Result<()> {
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        let is_temp = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with(&format!(".{TEMP_EXT}")))
            .unwrap_or(false);
        if is_temp {
            log::debug!("removing stale temp file {}", path.display());
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}
