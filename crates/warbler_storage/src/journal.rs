//! Segmented change journal backing [`JournalDurability`].
//!
//! Segment layout:
//! ```text
//! [magic "WBLR"][version u32 LE]
//! [len u32 LE][crc32 u32 LE][bincode Change] ...
//! ```
//! Segments are named `warbler_NNNNNN.journal` and rotate once the current
//! one would exceed the configured size. Recovery reads segments in order
//! and stops at the first truncated or corrupt record; everything before it
//! is returned.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use warbler_common::config::{JournalConfig, JournalSyncMode};
use warbler_common::error::StorageError;

use crate::durability::{Change, Durability};

/// Bump when `Change` changes incompatibly.
pub const JOURNAL_FORMAT_VERSION: u32 = 1;

pub const JOURNAL_MAGIC: &[u8; 4] = b"WBLR";

/// magic (4) + version (4)
pub const JOURNAL_SEGMENT_HEADER_SIZE: usize = 8;

/// len (4) + crc32 (4)
const RECORD_HEADER_SIZE: usize = 8;

const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

const SEGMENT_PREFIX: &str = "warbler_";
const SEGMENT_SUFFIX: &str = ".journal";

fn segment_filename(segment_id: u64) -> String {
    format!("{}{:06}{}", SEGMENT_PREFIX, segment_id, SEGMENT_SUFFIX)
}

fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Segment ids present in `dir`, ascending.
fn list_segments(dir: &Path) -> Result<Vec<u64>, StorageError> {
    let mut ids = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };
    for entry in entries.flatten() {
        if let Some(id) = parse_segment_id(&entry.file_name().to_string_lossy()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

struct ParsedSegment {
    changes: Vec<Change>,
    /// Bytes up to and including the last intact record.
    valid_len: usize,
    torn: bool,
}

fn parse_segment(data: &[u8], name: &str) -> Result<ParsedSegment, StorageError> {
    if data.len() < JOURNAL_SEGMENT_HEADER_SIZE {
        return Ok(ParsedSegment {
            changes: Vec::new(),
            valid_len: 0,
            torn: !data.is_empty(),
        });
    }
    if &data[0..4] != JOURNAL_MAGIC.as_slice() {
        return Err(StorageError::Journal(format!("{}: bad magic", name)));
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != JOURNAL_FORMAT_VERSION {
        return Err(StorageError::Journal(format!(
            "{}: unsupported format version {} (expected {})",
            name, version, JOURNAL_FORMAT_VERSION
        )));
    }

    let mut changes = Vec::new();
    let mut pos = JOURNAL_SEGMENT_HEADER_SIZE;
    let mut torn = false;
    while pos < data.len() {
        if pos + RECORD_HEADER_SIZE > data.len() {
            tracing::warn!("{}: truncated record header at {}, stopping recovery", name, pos);
            torn = true;
            break;
        }
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let checksum =
            u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        let body_start = pos + RECORD_HEADER_SIZE;
        if body_start + len > data.len() {
            tracing::warn!("{}: truncated record at {}, stopping recovery", name, pos);
            torn = true;
            break;
        }
        let body = &data[body_start..body_start + len];
        if crc32fast::hash(body) != checksum {
            tracing::warn!("{}: checksum mismatch at {}, stopping recovery", name, pos);
            torn = true;
            break;
        }
        match bincode::deserialize::<Change>(body) {
            Ok(change) => changes.push(change),
            Err(e) => {
                tracing::warn!("{}: undecodable record at {}: {}", name, pos, e);
                torn = true;
                break;
            }
        }
        pos = body_start + len;
    }
    Ok(ParsedSegment {
        changes,
        valid_len: pos,
        torn,
    })
}

// ── Writer ─────────────────────────────────────────────────────────────────

pub struct JournalWriter {
    inner: Mutex<JournalWriterInner>,
    sync_mode: JournalSyncMode,
    max_segment_size: u64,
}

struct JournalWriterInner {
    writer: BufWriter<File>,
    dir: PathBuf,
    current_segment: u64,
    current_segment_size: u64,
}

impl JournalWriter {
    pub fn open(dir: &Path, sync_mode: JournalSyncMode) -> Result<Self, StorageError> {
        Self::open_with_options(dir, sync_mode, DEFAULT_SEGMENT_SIZE)
    }

    /// Open for appending to the newest segment. A torn tail left by a crash
    /// is cut off first so new records follow the last intact one.
    pub fn open_with_options(
        dir: &Path,
        sync_mode: JournalSyncMode,
        max_segment_size: u64,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;

        let segment_id = list_segments(dir)?.last().copied().unwrap_or(0);
        let seg_path = dir.join(segment_filename(segment_id));

        let mut current_segment_size = 0u64;
        if seg_path.exists() {
            let data = fs::read(&seg_path)?;
            let parsed = parse_segment(&data, &segment_filename(segment_id))?;
            if parsed.torn {
                tracing::warn!(
                    "journal segment {} has a torn tail; truncating {} -> {} bytes",
                    segment_id,
                    data.len(),
                    parsed.valid_len
                );
                OpenOptions::new()
                    .write(true)
                    .open(&seg_path)?
                    .set_len(parsed.valid_len as u64)?;
            }
            current_segment_size = parsed.valid_len as u64;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&seg_path)?;
        let mut writer = BufWriter::new(file);
        if current_segment_size == 0 {
            writer.write_all(JOURNAL_MAGIC)?;
            writer.write_all(&JOURNAL_FORMAT_VERSION.to_le_bytes())?;
            writer.flush()?;
            current_segment_size = JOURNAL_SEGMENT_HEADER_SIZE as u64;
        }

        tracing::debug!(
            "journal opened at {} (segment {})",
            dir.display(),
            segment_id
        );
        Ok(Self {
            inner: Mutex::new(JournalWriterInner {
                writer,
                dir: dir.to_path_buf(),
                current_segment: segment_id,
                current_segment_size,
            }),
            sync_mode,
            max_segment_size,
        })
    }

    pub fn from_config(dir: &Path, config: &JournalConfig) -> Result<Self, StorageError> {
        Self::open_with_options(dir, config.sync_mode, config.max_segment_bytes)
    }

    /// Buffer one change. Not durable until `flush()`.
    pub fn append(&self, change: &Change) -> Result<(), StorageError> {
        let data =
            bincode::serialize(change).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let len = u32::try_from(data.len()).map_err(|_| {
            StorageError::Serialization(format!("journal record too large: {} bytes", data.len()))
        })?;
        let checksum = crc32fast::hash(&data);
        let record_size = (RECORD_HEADER_SIZE + data.len()) as u64;

        let mut inner = self.inner.lock();
        if inner.current_segment_size > JOURNAL_SEGMENT_HEADER_SIZE as u64
            && inner.current_segment_size + record_size > self.max_segment_size
        {
            self.rotate_segment(&mut inner)?;
        }

        inner.writer.write_all(&len.to_le_bytes())?;
        inner.writer.write_all(&checksum.to_le_bytes())?;
        inner.writer.write_all(&data)?;
        inner.current_segment_size += record_size;
        Ok(())
    }

    /// Push buffered records to the OS and sync per the configured mode.
    pub fn flush(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        self.flush_inner(&mut inner)
    }

    fn flush_inner(&self, inner: &mut JournalWriterInner) -> Result<(), StorageError> {
        inner.writer.flush()?;
        match self.sync_mode {
            JournalSyncMode::None => {}
            JournalSyncMode::FSync => inner.writer.get_ref().sync_all()?,
            JournalSyncMode::FDataSync => inner.writer.get_ref().sync_data()?,
        }
        Ok(())
    }

    fn rotate_segment(&self, inner: &mut JournalWriterInner) -> Result<(), StorageError> {
        self.flush_inner(inner)?;

        inner.current_segment += 1;
        let new_path = inner.dir.join(segment_filename(inner.current_segment));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&new_path)?;
        inner.writer = BufWriter::new(file);
        inner.writer.write_all(JOURNAL_MAGIC)?;
        inner.writer.write_all(&JOURNAL_FORMAT_VERSION.to_le_bytes())?;
        inner.current_segment_size = JOURNAL_SEGMENT_HEADER_SIZE as u64;

        tracing::debug!("journal rotated to segment {}", inner.current_segment);
        Ok(())
    }

    pub fn current_segment_id(&self) -> u64 {
        self.inner.lock().current_segment
    }

    pub fn dir(&self) -> PathBuf {
        self.inner.lock().dir.clone()
    }
}

// ── Reader ─────────────────────────────────────────────────────────────────

/// Reads every segment of a journal directory in order.
pub struct JournalReader {
    dir: PathBuf,
}

impl JournalReader {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// All intact changes, in append order. A missing directory is an empty
    /// journal. Reading stops at the first torn record, even if later
    /// segments exist.
    pub fn read_all(&self) -> Result<Vec<Change>, StorageError> {
        let mut changes = Vec::new();
        for seg_id in list_segments(&self.dir)? {
            let name = segment_filename(seg_id);
            let data = fs::read(self.dir.join(&name))?;
            let parsed = parse_segment(&data, &name)?;
            changes.extend(parsed.changes);
            if parsed.torn {
                break;
            }
        }
        Ok(changes)
    }
}

// ── Durability ─────────────────────────────────────────────────────────────

/// Journal-backed durability: append every change, then flush once.
pub struct JournalDurability {
    writer: JournalWriter,
}

impl JournalDurability {
    pub fn new(writer: JournalWriter) -> Self {
        Self { writer }
    }

    pub fn open(dir: &Path, config: &JournalConfig) -> Result<Self, StorageError> {
        Ok(Self::new(JournalWriter::from_config(dir, config)?))
    }

    pub fn writer(&self) -> &JournalWriter {
        &self.writer
    }
}

impl Durability for JournalDurability {
    fn commit(&self, changes: &[Change]) -> Result<(), StorageError> {
        for change in changes {
            self.writer.append(change)?;
        }
        self.writer.flush()
    }

    fn name(&self) -> &'static str {
        "journal"
    }
}
