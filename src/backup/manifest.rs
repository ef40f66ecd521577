//! Per-snapshot content manifest and the SHA-256 helpers shared by the engine and the verifier.

use crate::backup::atomic_json::{read_json, write_json_atomic};
use crate::backup::result_error::result::Result;
use bon::Builder;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, Metadata, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Component, Path, PathBuf};

pub static MANIFEST_FILE_NAME: &str = ".manifest.json";

/// Modification time with nanosecond precision.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Mtime {
    secs: i64,
    nanos: u32,
}

impl From<FileTime> for Mtime {
    fn from(value: FileTime) -> Self {
        Self {
            secs: value.unix_seconds(),
            nanos: value.nanoseconds(),
        }
    }
}

impl From<Mtime> for FileTime {
    fn from(value: Mtime) -> Self {
        FileTime::from_unix_time(value.secs, value.nanos)
    }
}

impl Mtime {
    pub fn of(metadata: &Metadata) -> Self {
        FileTime::from_last_modification_time(metadata).into()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Builder, Getters, CopyGetters)]
pub struct ManifestEntry {
    #[builder(into)]
    #[getset(get = "pub")]
    path: String,
    #[getset(get_copy = "pub")]
    size: u64,
    #[getset(get_copy = "pub")]
    mtime: Mtime,
    #[builder(into)]
    #[getset(get = "pub")]
    hash: String,
}

impl ManifestEntry {
    /// Same size and mtime, the cheap "unchanged" test.
    pub fn matches(&self, size: u64, mtime: Mtime) -> bool {
        self.size == size && self.mtime == mtime
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Getters, CopyGetters)]
pub struct Manifest {
    #[getset(get = "pub")]
    snapshot: String,
    #[getset(get_copy = "pub")]
    created_at: DateTime<Utc>,
    #[getset(get_copy = "pub")]
    file_count: u64,
    #[getset(get_copy = "pub")]
    total_size: u64,
    #[getset(get = "pub")]
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new<S: Into<String>>(snapshot: S, mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_unstable_by(|a, b| a.path.cmp(&b.path));
        Self {
            snapshot: snapshot.into(),
            created_at: Utc::now(),
            file_count: entries.len() as u64,
            total_size: entries.iter().map(|e| e.size).sum(),
            entries,
        }
    }

    pub fn load<P: AsRef<Path>>(snapshot_dir: P) -> Result<Option<Self>> {
        read_json(snapshot_dir.as_ref().join(MANIFEST_FILE_NAME))
    }

    pub fn save<P: AsRef<Path>>(&self, snapshot_dir: P) -> Result<()> {
        write_json_atomic(snapshot_dir.as_ref().join(MANIFEST_FILE_NAME), self)
    }
}

/// Manifest key for a path relative to the snapshot root, always `/` separated.
///
/// Names are kept as UTF-8 where they are valid. `%` and bytes that are not valid UTF-8 are
/// written as `%XX`, so every file name maps to its own key and [`key_path`] gets it back.
pub fn manifest_key<P: AsRef<Path>>(relative: P) -> String {
    let mut key = String::new();
    for name in relative.as_ref().components().filter_map(|c| match c {
        Component::Normal(s) => Some(s),
        _ => None,
    }) {
        if !key.is_empty() {
            key.push('/');
        }
        escape_name(name, &mut key);
    }
    key
}

fn escape_name(name: &OsStr, out: &mut String) {
    for chunk in name.as_bytes().utf8_chunks() {
        for c in chunk.valid().chars() {
            match c {
                '%' => out.push_str("%25"),
                c => out.push(c),
            }
        }
        for b in chunk.invalid() {
            out.push_str(&format!("%{b:02X}"));
        }
    }
}

/// Relative path a manifest key was made from.
pub fn key_path(key: &str) -> PathBuf {
    let raw = key.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let escaped = (raw[i] == b'%')
            .then(|| raw.get(i + 1..i + 3))
            .flatten()
            .and_then(|hex| std::str::from_utf8(hex).ok())
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match escaped {
            Some(b) => {
                bytes.push(b);
                i += 3;
            }
            None => {
                bytes.push(raw[i]);
                i += 1;
            }
        }
    }
    PathBuf::from(OsString::from_vec(bytes))
}

/// Forwards writes while feeding them to a SHA-256 digest.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

pub fn hash_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut writer = HashingWriter::new(std::io::sink());
    std::io::copy(&mut reader, &mut writer)?;
    Ok(writer.finish().1)
}

/// Copies `src` into a new file at `dst` and returns `(bytes, sha256)` of what was read.
pub fn copy_and_hash<P1: AsRef<Path>, P2: AsRef<Path>>(src: P1, dst: P2) -> Result<(u64, String)> {
    let mut reader = BufReader::new(File::open(src)?);
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)?;
    let mut writer = HashingWriter::new(BufWriter::new(file));
    let bytes = std::io::copy(&mut reader, &mut writer)?;
    let (buffered, hash) = writer.finish();
    let file = buffered.into_inner().map_err(std::io::IntoInnerError::into_error)?;
    file.sync_data()?;
    Ok((bytes, hash))
}
