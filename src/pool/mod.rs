//! Pooled-handle VFS: a fixed-capacity pool of pre-provisioned files inside
//! one directory, reassigned between logical paths over time.
//!
//! Slot files carry opaque random names; the owning path lives only in each
//! slot's self-describing header (`header`), so the path association is
//! rebuilt from headers at attach time with no external index. A header
//! whose digest does not verify is wiped back to the pool rather than
//! trusted or repaired.
//!
//! Submodules:
//! - `header`: slot header codec and integrity digest

pub mod header;

use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, warn};

use crate::vfs::{
    Fd, OpenFlags, ReadOutcome, SyncFlags, Vfs, VfsError, VfsResult, DEFAULT_POOL_CAPACITY,
};
use header::{HeaderError, SlotHeader, HEADER_OFFSET_DATA, HEADER_SIZE};

/// Fatal pool errors: attach-phase failures and capacity management. Per-call
/// I/O problems surface as `VfsError` through the `Vfs` trait instead.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("slot handle unavailable after retries: {0}")]
    HandleUnavailable(String),
    #[error("pool task panicked: {0}")]
    Join(String),
}

#[derive(Debug, Clone)]
pub struct HandlePoolOptions {
    pub directory: PathBuf,
    /// Slots provisioned when the directory holds none.
    pub initial_capacity: u32,
}

impl HandlePoolOptions {
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            initial_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

struct PoolSlot {
    file: File,
    opaque: String,
}

struct PoolOpenFile {
    path: String,
    flags: OpenFlags,
}

/// VFS over a directory of pooled slot files. Synchronous positional I/O on
/// the operation path; async only in `attach` and capacity management.
pub struct HandlePoolVfs {
    dir: PathBuf,
    slots: HashMap<String, PoolSlot>,
    by_path: HashMap<String, String>,
    available: Vec<String>,
    open_files: HashMap<Fd, PoolOpenFile>,
}

/// Backoff schedule for transient slot-open failures: doubling delays,
/// bounded at roughly ten seconds in total.
async fn open_slot_with_retry(path: PathBuf) -> Result<File, PoolError> {
    let mut delay = std::time::Duration::from_millis(100);
    let deadline = std::time::Duration::from_secs(10);
    let mut waited = std::time::Duration::ZERO;
    loop {
        let p = path.clone();
        let attempt = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new().read(true).write(true).open(p)
        })
        .await
        .map_err(|e| PoolError::Join(e.to_string()))?;
        match attempt {
            Ok(file) => return Ok(file),
            Err(e) if waited + delay > deadline => {
                return Err(PoolError::HandleUnavailable(format!(
                    "{}: {e}",
                    path.display()
                )));
            }
            Err(_) => {
                tokio::time::sleep(delay).await;
                waited += delay;
                delay *= 2;
            }
        }
    }
}

fn random_opaque() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mixed = nanos ^ n.rotate_left(17) ^ ((std::process::id() as u64) << 32);
    hex::encode(mixed.to_be_bytes())
}

fn read_header(file: &File) -> Result<SlotHeader, HeaderError> {
    let mut buf = [0u8; HEADER_SIZE];
    match file.read_exact_at(&mut buf, 0) {
        Ok(()) => SlotHeader::decode(&buf),
        // Too short to hold a header at all: corrupt, caller wipes it.
        Err(_) => Err(HeaderError::DigestMismatch),
    }
}

fn write_header(file: &File, header: &SlotHeader) -> VfsResult<()> {
    let buf = header
        .encode()
        .map_err(|e| VfsError::io(format!("encode slot header: {e}")))?;
    file.write_all_at(&buf, 0)
        .map_err(|e| VfsError::io(format!("write slot header: {e}")))
}

/// Reset a slot to the unassociated state: zero path and flags, sentinel
/// digest, empty data region.
fn wipe_slot(file: &File) -> VfsResult<()> {
    write_header(file, &SlotHeader::Unassociated)?;
    file.set_len(HEADER_OFFSET_DATA)
        .map_err(|e| VfsError::io(format!("truncate slot data: {e}")))
}

impl HandlePoolVfs {
    /// Readiness phase: open every slot file in the directory, verify its
    /// header, rebuild the path association table, and self-heal anything
    /// corrupted or ephemeral. Provisions `initial_capacity` slots when the
    /// directory is empty.
    pub async fn attach(options: HandlePoolOptions) -> Result<Self, PoolError> {
        tokio::fs::create_dir_all(&options.directory).await?;

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&options.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        let opens = names.into_iter().map(|opaque| {
            let path = options.directory.join(&opaque);
            async move {
                let file = open_slot_with_retry(path).await?;
                Ok::<(String, File), PoolError>((opaque, file))
            }
        });
        let opened = futures::future::try_join_all(opens).await?;

        let mut vfs = Self {
            dir: options.directory.clone(),
            slots: HashMap::new(),
            by_path: HashMap::new(),
            available: Vec::new(),
            open_files: HashMap::new(),
        };

        for (opaque, file) in opened {
            match read_header(&file) {
                Ok(SlotHeader::Associated { path, flags })
                    if flags.is_persistent() && !vfs.by_path.contains_key(&path) =>
                {
                    debug!(slot = %opaque, %path, "recovered slot association");
                    vfs.by_path.insert(path, opaque.clone());
                }
                Ok(SlotHeader::Associated { path, flags }) => {
                    // Ephemeral type, delete-on-close leftover, or a
                    // duplicate claim on an already-recovered path.
                    warn!(slot = %opaque, %path, ?flags, "wiping non-persistent slot");
                    wipe_slot(&file).map_err(|e| PoolError::Io(io_from_vfs(e)))?;
                    vfs.available.push(opaque.clone());
                }
                Ok(SlotHeader::Unassociated) => vfs.available.push(opaque.clone()),
                Err(e) => {
                    warn!(slot = %opaque, error = %e, "corrupted slot header, resetting");
                    wipe_slot(&file).map_err(|e| PoolError::Io(io_from_vfs(e)))?;
                    vfs.available.push(opaque.clone());
                }
            }
            vfs.slots.insert(opaque.clone(), PoolSlot { file, opaque });
        }

        if vfs.slots.is_empty() {
            vfs.add_capacity(options.initial_capacity)?;
        }
        Ok(vfs)
    }

    /// Total slot count, associated or not.
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Associated slot count. Always `<= capacity()`.
    pub fn size(&self) -> u32 {
        self.by_path.len() as u32
    }

    /// Grow the pool by `n` freshly provisioned slots. Returns the new
    /// capacity.
    pub fn add_capacity(&mut self, n: u32) -> Result<u32, PoolError> {
        for _ in 0..n {
            let mut opaque = random_opaque();
            while self.slots.contains_key(&opaque) {
                opaque = random_opaque();
            }
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(self.dir.join(&opaque))?;
            wipe_slot(&file).map_err(io_from_vfs)?;
            self.available.push(opaque.clone());
            self.slots.insert(opaque.clone(), PoolSlot { file, opaque });
        }
        Ok(self.capacity())
    }

    /// Shrink the pool by up to `n` unassociated slots; associated slots are
    /// never reclaimed. Returns how many were actually removed.
    pub fn remove_capacity(&mut self, n: u32) -> Result<u32, PoolError> {
        let mut removed = 0u32;
        while removed < n {
            let Some(opaque) = self.available.pop() else {
                break;
            };
            self.slots.remove(&opaque);
            std::fs::remove_file(self.dir.join(&opaque))?;
            removed += 1;
        }
        Ok(removed)
    }

    fn slot_for_fd(&self, fd: Fd) -> VfsResult<&PoolSlot> {
        let open = self.open_files.get(&fd).ok_or(VfsError::BadFd(fd))?;
        let opaque = self
            .by_path
            .get(&open.path)
            .ok_or_else(|| VfsError::io(format!("{} no longer associated", open.path)))?;
        self.slots
            .get(opaque)
            .ok_or_else(|| VfsError::io(format!("slot {opaque} missing")))
    }

    fn disassociate(&mut self, path: &str) -> VfsResult<bool> {
        let Some(opaque) = self.by_path.remove(path) else {
            return Ok(false);
        };
        let slot = self
            .slots
            .get(&opaque)
            .ok_or_else(|| VfsError::io(format!("slot {opaque} missing")))?;
        wipe_slot(&slot.file)?;
        self.available.push(opaque);
        Ok(true)
    }
}

fn io_from_vfs(e: VfsError) -> std::io::Error {
    std::io::Error::other(e.to_string())
}

impl Vfs for HandlePoolVfs {
    fn open(&mut self, path: &str, fd: Fd, flags: OpenFlags) -> VfsResult<OpenFlags> {
        if self.open_files.contains_key(&fd) {
            return Err(VfsError::io(format!("fd {fd} already in use")));
        }
        if !self.by_path.contains_key(path) {
            if !flags.contains(OpenFlags::CREATE) {
                return Err(VfsError::cant_open(path, "file not found"));
            }
            let Some(opaque) = self.available.pop() else {
                return Err(VfsError::cant_open(path, "pool at capacity"));
            };
            let header = SlotHeader::associated(path, flags)
                .map_err(|e| VfsError::cant_open(path, e.to_string()))?;
            let slot = self
                .slots
                .get(&opaque)
                .ok_or_else(|| VfsError::io(format!("slot {opaque} missing")))?;
            if let Err(e) = write_header(&slot.file, &header) {
                self.available.push(opaque);
                return Err(e);
            }
            self.by_path.insert(path.to_string(), opaque);
        }
        self.open_files.insert(
            fd,
            PoolOpenFile {
                path: path.to_string(),
                flags,
            },
        );
        Ok(flags)
    }

    fn close(&mut self, fd: Fd) -> VfsResult<()> {
        let open = self.open_files.remove(&fd).ok_or(VfsError::BadFd(fd))?;
        if open.flags.contains(OpenFlags::DELETE_ON_CLOSE) {
            self.disassociate(&open.path)?;
        }
        Ok(())
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8], offset: u64) -> VfsResult<ReadOutcome> {
        let slot = self.slot_for_fd(fd)?;
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = slot
                .file
                .read_at(&mut buf[filled..], HEADER_OFFSET_DATA + offset + filled as u64)
                .map_err(|e| VfsError::io(format!("slot read: {e}")))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < buf.len() {
            buf[filled..].fill(0);
            return Ok(ReadOutcome::ShortRead);
        }
        Ok(ReadOutcome::Complete)
    }

    fn write(&mut self, fd: Fd, data: &[u8], offset: u64) -> VfsResult<()> {
        let slot = self.slot_for_fd(fd)?;
        slot.file
            .write_all_at(data, HEADER_OFFSET_DATA + offset)
            .map_err(|e| VfsError::io(format!("slot write: {e}")))
    }

    fn truncate(&mut self, fd: Fd, size: u64) -> VfsResult<()> {
        let slot = self.slot_for_fd(fd)?;
        slot.file
            .set_len(HEADER_OFFSET_DATA + size)
            .map_err(|e| VfsError::io(format!("slot truncate: {e}")))
    }

    fn sync(&mut self, fd: Fd, flags: SyncFlags) -> VfsResult<()> {
        let slot = self.slot_for_fd(fd)?;
        let res = match flags {
            SyncFlags::Full => slot.file.sync_all(),
            SyncFlags::Normal => slot.file.sync_data(),
        };
        res.map_err(|e| VfsError::io(format!("slot sync: {e}")))
    }

    fn file_size(&self, fd: Fd) -> VfsResult<u64> {
        let slot = self.slot_for_fd(fd)?;
        let len = slot
            .file
            .metadata()
            .map_err(|e| VfsError::io(format!("slot metadata: {e}")))?
            .len();
        Ok(len.saturating_sub(HEADER_OFFSET_DATA))
    }

    fn access(&self, path: &str) -> VfsResult<bool> {
        Ok(self.by_path.contains_key(path))
    }

    fn delete(&mut self, path: &str, _sync_dir: bool) -> VfsResult<()> {
        self.disassociate(path)?;
        Ok(())
    }
}
