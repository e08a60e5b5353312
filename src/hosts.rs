//! Hosts file index.
//!
//! A [`HostsIndex`] owns at most one [`HostsSnapshot`]: a read-only memory
//! mapping of the hosts file plus a sorted vector of (address, name) offsets
//! into that mapping. Lookups binary-search the vector.
//!
//! Freshness is checked on every query by comparing the file's length and
//! modification time with the values captured when the snapshot was built.
//! The check and any rebuild run under an exclusive advisory lock on the file.
//! A rebuild constructs the new snapshot completely before it replaces the
//! old one, and readers hold the old one through an `Arc`, so nobody ever
//! observes a partially built index.

use crate::error::{HostsError, Result};
use memmap2::{Mmap, MmapOptions};
use std::cmp::Ordering;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, trace, warn};

/// Well-known location of the hosts file.
pub const DEFAULT_HOSTS_PATH: &str = "/etc/hosts";

/// Lines whose address token is longer than this are dropped.
pub const MAX_ADDR_LEN: usize = 64;

/// Names of this length or longer are not indexed.
pub const MAX_HOST_LEN: usize = 256;

/// `isspace` in the C locale.
fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\x0b' | b'\x0c' | b'\r')
}

/// The whitespace-terminated token starting at `offset`.
pub(crate) fn token(data: &[u8], offset: usize) -> &[u8] {
    let rest = data.get(offset..).unwrap_or(&[]);
    let len = rest.iter().position(|&b| is_space(b)).unwrap_or(rest.len());
    &rest[..len]
}

/// Orders two tokens by their common prefix, then by length.
///
/// A token that is a strict prefix of another sorts first.
pub fn compare_tokens(a: &[u8], b: &[u8]) -> Ordering {
    let common = a.len().min(b.len());
    a[..common]
        .cmp(&b[..common])
        .then_with(|| a.len().cmp(&b.len()))
}

/// One indexed hostname: offsets of its address token and of the name
/// token itself, both into the owning snapshot's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub addr: usize,
    pub name: usize,
}

/// Scans a hosts buffer and returns its entries sorted by name.
pub(crate) fn build_index(data: &[u8]) -> Vec<IndexEntry> {
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let start = pos;
        let eol = data[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(data.len(), |i| start + i);
        pos = eol + 1;

        let line = &data[start..eol];
        if matches!(line.first(), None | Some(b'#')) {
            continue;
        }

        // The address is the first token, wherever the line's indentation ends.
        let lead = line.iter().position(|&b| !is_space(b)).unwrap_or(line.len());
        let addr_len = token(line, lead).len();
        if addr_len == 0 || addr_len > MAX_ADDR_LEN {
            trace!(line_offset = start, addr_len, "Skipping hosts line");
            continue;
        }

        let mut cursor = lead + addr_len;
        loop {
            while cursor < line.len() && is_space(line[cursor]) {
                cursor += 1;
            }
            if cursor >= line.len() {
                break;
            }
            let name_len = token(line, cursor).len();
            if name_len < MAX_HOST_LEN {
                entries.push(IndexEntry {
                    addr: start + lead,
                    name: start + cursor,
                });
            }
            cursor += name_len;
        }
    }

    // Stable, so duplicate names keep file order.
    entries.sort_by(|a, b| compare_tokens(token(data, a.name), token(data, b.name)));
    entries
}

/// Finds the first entry named `name` in a sorted index.
///
/// Half-open bounds: the range is empty exactly when `lo == hi`, so nothing
/// is ever decremented below zero.
pub(crate) fn search(data: &[u8], entries: &[IndexEntry], name: &[u8]) -> Option<IndexEntry> {
    let (mut lo, mut hi) = (0usize, entries.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if compare_tokens(token(data, entries[mid].name), name) == Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }

    entries
        .get(lo)
        .copied()
        .filter(|e| token(data, e.name) == name)
}

/// One successfully loaded view of the hosts file.
#[derive(Debug)]
pub struct HostsSnapshot {
    source: PathBuf,
    map: Option<Mmap>,
    len: u64,
    modified: Option<SystemTime>,
    entries: Vec<IndexEntry>,
}

impl HostsSnapshot {
    /// Maps `file` read-only and indexes it.
    fn load(source: &Path, file: &File, len: u64, modified: Option<SystemTime>) -> io::Result<Self> {
        let map = if len == 0 {
            None
        } else {
            let map_len = usize::try_from(len)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "hosts file too large"))?;
            // SAFETY: the mapping is read-only and the file is held under an
            // exclusive advisory lock while it is indexed. Cooperating writers
            // replace the file rather than truncating it in place.
            Some(unsafe { MmapOptions::new().len(map_len).map(file)? })
        };

        let entries = build_index(map.as_deref().unwrap_or(&[]));

        Ok(Self {
            source: source.to_path_buf(),
            map,
            len,
            modified,
            entries,
        })
    }

    /// True if this snapshot was built from `source` with the given metadata.
    fn is_current(&self, source: &Path, len: u64, modified: Option<SystemTime>) -> bool {
        self.source == source && self.len == len && self.modified == modified
    }

    /// The mapped file contents.
    pub fn data(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    /// Index entries in sorted order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Address token of `entry`.
    pub fn address_of(&self, entry: IndexEntry) -> &[u8] {
        token(self.data(), entry.addr)
    }

    /// Name token of `entry`.
    pub fn name_of(&self, entry: IndexEntry) -> &[u8] {
        token(self.data(), entry.name)
    }

    /// Exact, case-sensitive lookup of `name`.
    ///
    /// Names that are empty or contain whitespace can never match a token.
    pub fn lookup(&self, name: &str) -> Option<IndexEntry> {
        let name = name.as_bytes();
        if name.is_empty() || name.iter().any(|&b| is_space(b)) {
            return None;
        }
        search(self.data(), &self.entries, name)
    }
}

/// Outcome of [`HostsIndex::ensure_fresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// The current snapshot still matches the file.
    Unchanged,
    /// A new snapshot replaced the old one (or the absent one).
    Rebuilt { entries: usize },
    /// The file could not be accessed; the previous snapshot, if any, stays.
    Unavailable,
}

/// Exclusive `flock` held for the duration of a freshness check.
struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn exclusive(file: &'a File) -> io::Result<Self> {
        loop {
            // SAFETY: the descriptor is owned by `file`, which outlives the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(Self { file });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        // SAFETY: as above; closing the file would release the lock anyway.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Owner of the current hosts snapshot.
#[derive(Debug)]
pub struct HostsIndex {
    path: PathBuf,
    snapshot: Option<Arc<HostsSnapshot>>,
}

impl HostsIndex {
    /// Creates an index over the file at `path`. Nothing is read until the
    /// first [`ensure_fresh`](Self::ensure_fresh).
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            snapshot: None,
        }
    }

    /// Path of the hosts file this index tracks.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Retargets the index. The current snapshot keeps serving until the
    /// new file has been loaded successfully.
    pub fn set_path<P: AsRef<Path>>(&mut self, path: P) {
        let path = path.as_ref();
        if path != self.path {
            info!(old = %self.path.display(), new = %path.display(), "Hosts file path changed");
            self.path = path.to_path_buf();
        }
    }

    /// The current snapshot, if one has been loaded.
    pub fn snapshot(&self) -> Option<Arc<HostsSnapshot>> {
        self.snapshot.clone()
    }

    /// Looks `name` up in the current snapshot.
    pub fn lookup(&self, name: &str) -> Option<IndexEntry> {
        self.snapshot.as_ref()?.lookup(name)
    }

    /// Makes the snapshot match the file on disk, rebuilding when the file's
    /// length or modification time changed. Access failures keep the
    /// previous snapshot and are only logged.
    pub fn ensure_fresh(&mut self) -> Refresh {
        match self.refresh() {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    error = %e,
                    has_snapshot = self.snapshot.is_some(),
                    "Hosts file unavailable, keeping previous snapshot"
                );
                Refresh::Unavailable
            }
        }
    }

    fn refresh(&mut self) -> Result<Refresh> {
        let path = self.path.clone();
        let unavailable = |source: io::Error| HostsError::ResourceUnavailable {
            path: path.clone(),
            source,
        };

        let file = File::open(&path).map_err(unavailable)?;
        let _lock = FileLock::exclusive(&file).map_err(unavailable)?;
        let meta = file.metadata().map_err(unavailable)?;
        let modified = meta.modified().ok();

        if let Some(current) = &self.snapshot {
            if current.is_current(&path, meta.len(), modified) {
                trace!(path = %path.display(), "Hosts snapshot is current");
                return Ok(Refresh::Unchanged);
            }
            debug!(path = %path.display(), "Hosts file changed, rebuilding index");
        }

        let snapshot = HostsSnapshot::load(&path, &file, meta.len(), modified).map_err(unavailable)?;
        let entries = snapshot.entries().len();

        // The old mapping is released when its last reader lets go of it.
        self.snapshot = Some(Arc::new(snapshot));

        info!(
            path = %path.display(),
            bytes = meta.len(),
            entries,
            "Hosts index rebuilt"
        );
        Ok(Refresh::Rebuilt { entries })
    }
}
