use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use data_error::{LeaseError, Result};
use linked_hash_map::LinkedHashMap;

use crate::lease::{ReadLease, ReadWriteLease};

/// The allocation seam consumed by [`crate::AutoRefreshingReadLease`].
pub trait Leaser: Send + Sync {
    /// Allocate a read/write lease for `size` bytes, evicting idle read
    /// leases as needed to satisfy the budget.
    fn new_file(&self, size: u64) -> Result<Box<dyn ReadWriteLease>>;
}

/// A leaser that stores lease contents in plain files under a given
/// directory, within a bounded byte budget.
///
/// Read/write leases are pinned; read leases are evictable and reclaimed in
/// least-recently-used order whenever a new allocation needs room. Cloning
/// is cheap and all clones share the same budget.
#[derive(Clone)]
pub struct FileLeaser {
    shared: Arc<LeaserShared>,
}

struct LeaserShared {
    /// Label for logging
    label: String,
    /// Directory holding the lease files
    dir: PathBuf,
    /// The maximum allowable usage in bytes
    limit: u64,
    state: Mutex<LeaserState>,
}

struct LeaserState {
    /// Bytes currently reserved by live leases
    used: u64,
    next_id: u64,
    /// Read leases in LRU order, oldest first
    evictable: LinkedHashMap<u64, Arc<LeaseCore>>,
}

/// State shared between a lease handle and the leaser, so that the leaser
/// can evict the backing file while the handle is still held.
struct LeaseCore {
    id: u64,
    /// Bytes reserved against the budget for this lease's whole lifetime
    size: u64,
    path: PathBuf,
    /// Whether the reservation has been returned to the budget.
    /// Only flipped while holding the leaser state lock.
    detached: AtomicBool,
    slot: Mutex<FileSlot>,
}

struct FileSlot {
    /// The backing file, or None once evicted or released
    file: Option<File>,
    /// Sequential cursor for read/write
    pos: u64,
}

/// Keep going on poisoned locks so releasing can proceed during unwind.
fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn add_offset(base: u64, delta: i64) -> Option<u64> {
    if delta >= 0 {
        base.checked_add(delta as u64)
    } else {
        base.checked_sub(delta.unsigned_abs())
    }
}

impl FileLeaser {
    /// Create a new leaser keeping its lease files under `dir`,
    /// which is created if missing.
    ///
    /// # Arguments
    /// * `label` - Identifier used in logs
    /// * `dir` - Directory where lease files are stored
    /// * `limit` - Maximum bytes to keep allocated across all leases
    pub fn new(label: String, dir: &Path, limit: u64) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|err| {
            LeaseError::Storage(
                label.clone(),
                format!("Failed to create lease dir {}: {}", dir.display(), err),
            )
        })?;

        log::debug!(
            "leaser/{}: initialized with {} bytes limit in {}",
            label,
            limit,
            dir.display()
        );

        Ok(Self {
            shared: Arc::new(LeaserShared {
                label,
                dir: PathBuf::from(dir),
                limit,
                state: Mutex::new(LeaserState {
                    used: 0,
                    next_id: 0,
                    evictable: LinkedHashMap::new(),
                }),
            }),
        })
    }

    /// Bytes currently reserved by live leases.
    pub fn used_bytes(&self) -> u64 {
        lock_or_recover(&self.shared.state).used
    }

    /// The byte budget this leaser was created with.
    pub fn limit_bytes(&self) -> u64 {
        self.shared.limit
    }
}

impl Leaser for FileLeaser {
    fn new_file(&self, size: u64) -> Result<Box<dyn ReadWriteLease>> {
        self.shared.new_file(size)
    }
}

impl LeaserShared {
    fn new_file(self: &Arc<Self>, size: u64) -> Result<Box<dyn ReadWriteLease>> {
        if size > self.limit {
            return Err(LeaseError::OutOfCapacity {
                requested: size,
                limit: self.limit,
            });
        }

        let mut state = lock_or_recover(&self.state);

        // Make room. Write leases are pinned, so this can run out of
        // victims; in that case we go over budget rather than fail a
        // request that a later release would have satisfied.
        while state.used + size > self.limit && self.evict_lru(&mut state) {}
        if state.used + size > self.limit {
            log::warn!(
                "leaser/{}: {} bytes requested with {}/{} in use and no evictable leases left",
                self.label,
                size,
                state.used,
                self.limit
            );
        }

        let id = state.next_id;
        state.next_id += 1;

        let path = self.dir.join(format!("{}-{:06}.lease", self.label, id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| {
                LeaseError::Storage(
                    self.label.clone(),
                    format!("Failed to create lease file {}: {}", path.display(), err),
                )
            })?;

        state.used += size;
        log::debug!(
            "leaser/{}: allocated {} bytes for lease {} ({}/{} in use)",
            self.label,
            size,
            id,
            state.used,
            self.limit
        );

        let core = Arc::new(LeaseCore {
            id,
            size,
            path,
            detached: AtomicBool::new(false),
            slot: Mutex::new(FileSlot {
                file: Some(file),
                pos: 0,
            }),
        });

        Ok(Box::new(FileReadWriteLease {
            shared: Arc::clone(self),
            core: Mutex::new(Some(core)),
        }))
    }

    /// Evict the least recently used read lease, returning false if there
    /// is nothing left to evict.
    fn evict_lru(&self, state: &mut LeaserState) -> bool {
        let (id, core) = match state.evictable.pop_front() {
            Some(entry) => entry,
            None => return false,
        };

        core.detached.store(true, Ordering::SeqCst);
        state.used = state.used.saturating_sub(core.size);
        self.delete_backing(&core);

        log::debug!(
            "leaser/{}: evicted lease {} ({} bytes, {} in use)",
            self.label,
            id,
            core.size,
            state.used
        );
        true
    }

    /// Return a lease's reservation to the budget and delete its file.
    /// Idempotent: eviction and release may both reach this.
    fn release_core(&self, core: &Arc<LeaseCore>) {
        {
            let mut state = lock_or_recover(&self.state);
            if !core.detached.swap(true, Ordering::SeqCst) {
                state.evictable.remove(&core.id);
                state.used = state.used.saturating_sub(core.size);
            }
        }
        self.delete_backing(core);
        log::debug!("leaser/{}: released lease {}", self.label, core.id);
    }

    fn delete_backing(&self, core: &LeaseCore) {
        let mut slot = lock_or_recover(&core.slot);
        if slot.file.take().is_some() {
            if let Err(err) = fs::remove_file(&core.path) {
                log::warn!(
                    "leaser/{}: failed to remove lease file {}: {}",
                    self.label,
                    core.path.display(),
                    err
                );
            }
        }
    }

    /// Mark a read lease as recently used.
    fn touch(&self, core: &LeaseCore) {
        let mut state = lock_or_recover(&self.state);
        state.evictable.get_refresh(&core.id);
    }

    /// Register a downgraded lease as an eviction candidate.
    fn register_evictable(&self, core: &Arc<LeaseCore>) {
        let mut state = lock_or_recover(&self.state);
        state.evictable.insert(core.id, Arc::clone(core));
        while state.used > self.limit && self.evict_lru(&mut state) {}
    }

    /// Remove a lease from the eviction candidates for the duration of an
    /// upgrade. Fails if the lease has already been evicted.
    fn pin(&self, core: &LeaseCore) -> Result<()> {
        let mut state = lock_or_recover(&self.state);
        if core.detached.load(Ordering::SeqCst) {
            return Err(LeaseError::Revoked);
        }
        state.evictable.remove(&core.id);
        Ok(())
    }
}

impl LeaseCore {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut slot = lock_or_recover(&self.slot);
        let pos = slot.pos;
        let file = slot.file.as_mut().ok_or(LeaseError::Revoked)?;
        file.seek(SeekFrom::Start(pos))?;
        let n = file.read(buf)?;
        slot.pos += n as u64;
        Ok(n)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut slot = lock_or_recover(&self.slot);
        let file = slot.file.as_mut().ok_or(LeaseError::Revoked)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(file.read(buf)?)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut slot = lock_or_recover(&self.slot);
        let pos = slot.pos;
        let file = slot.file.as_mut().ok_or(LeaseError::Revoked)?;
        file.seek(SeekFrom::Start(pos))?;
        let n = file.write(buf)?;
        slot.pos += n as u64;
        Ok(n)
    }

    /// Move the sequential cursor. `end` is the offset that
    /// `SeekFrom::End` is relative to.
    fn seek_to(&self, pos: SeekFrom, end: u64) -> Result<u64> {
        let mut slot = lock_or_recover(&self.slot);
        if slot.file.is_none() {
            return Err(LeaseError::Revoked);
        }

        let new_pos = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => add_offset(slot.pos, delta),
            SeekFrom::End(delta) => add_offset(end, delta),
        }
        .ok_or_else(|| {
            LeaseError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            ))
        })?;

        slot.pos = new_pos;
        Ok(new_pos)
    }

    /// Current length of the backing file.
    fn len(&self) -> Result<u64> {
        let slot = lock_or_recover(&self.slot);
        let file = slot.file.as_ref().ok_or(LeaseError::Revoked)?;
        Ok(file.metadata()?.len())
    }

    fn sync(&self) -> Result<()> {
        let slot = lock_or_recover(&self.slot);
        let file = slot.file.as_ref().ok_or(LeaseError::Revoked)?;
        file.sync_all()?;
        Ok(())
    }

    fn evicted(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

/// File-backed read lease handed out by [`FileLeaser`].
struct FileReadLease {
    shared: Arc<LeaserShared>,
    /// Declared size, kept here so it survives revocation
    size: u64,
    /// Taken out by the one-way transitions (upgrade, revoke)
    core: Mutex<Option<Arc<LeaseCore>>>,
}

impl FileReadLease {
    fn core(&self) -> Option<Arc<LeaseCore>> {
        lock_or_recover(&self.core).clone()
    }

    fn take_core(&self) -> Option<Arc<LeaseCore>> {
        lock_or_recover(&self.core).take()
    }
}

impl ReadLease for FileReadLease {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let core = self.core().ok_or(LeaseError::Revoked)?;
        self.shared.touch(&core);
        core.read(buf)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let core = self.core().ok_or(LeaseError::Revoked)?;
        self.shared.touch(&core);
        core.read_at(buf, offset)
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let core = self.core().ok_or(LeaseError::Revoked)?;
        self.shared.touch(&core);
        core.seek_to(pos, self.size)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn revoked(&self) -> bool {
        match self.core() {
            Some(core) => core.evicted(),
            None => true,
        }
    }

    fn upgrade(&self) -> Result<Box<dyn ReadWriteLease>> {
        let core = self.take_core().ok_or(LeaseError::Revoked)?;
        self.shared.pin(&core)?;
        Ok(Box::new(FileReadWriteLease {
            shared: Arc::clone(&self.shared),
            core: Mutex::new(Some(core)),
        }))
    }

    fn revoke(&self) {
        if let Some(core) = self.take_core() {
            self.shared.release_core(&core);
        }
    }
}

impl Drop for FileReadLease {
    fn drop(&mut self) {
        if let Some(core) = self.take_core() {
            self.shared.release_core(&core);
        }
    }
}

/// File-backed read/write lease handed out by [`FileLeaser`].
/// Not evictable; ends by downgrade or release.
struct FileReadWriteLease {
    shared: Arc<LeaserShared>,
    core: Mutex<Option<Arc<LeaseCore>>>,
}

impl FileReadWriteLease {
    fn core(&self) -> Option<Arc<LeaseCore>> {
        lock_or_recover(&self.core).clone()
    }

    fn take_core(&self) -> Option<Arc<LeaseCore>> {
        lock_or_recover(&self.core).take()
    }
}

impl ReadWriteLease for FileReadWriteLease {
    fn write(&self, buf: &[u8]) -> Result<usize> {
        let core = self.core().ok_or(LeaseError::Revoked)?;
        core.write(buf)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let core = self.core().ok_or(LeaseError::Revoked)?;
        core.read(buf)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let core = self.core().ok_or(LeaseError::Revoked)?;
        core.read_at(buf, offset)
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let core = self.core().ok_or(LeaseError::Revoked)?;
        let end = match pos {
            SeekFrom::End(_) => core.len()?,
            _ => 0,
        };
        core.seek_to(pos, end)
    }

    fn size(&self) -> Result<u64> {
        let core = self.core().ok_or(LeaseError::Revoked)?;
        core.len()
    }

    fn downgrade(&self) -> Result<Box<dyn ReadLease>> {
        let core = self.take_core().ok_or(LeaseError::Revoked)?;

        if let Err(err) = core.sync() {
            self.shared.release_core(&core);
            return Err(LeaseError::Downgrade(format!(
                "Failed to sync lease {}: {}",
                core.id, err
            )));
        }

        // The sequential cursor carries over to the read lease.
        self.shared.register_evictable(&core);

        Ok(Box::new(FileReadLease {
            shared: Arc::clone(&self.shared),
            size: core.size,
            core: Mutex::new(Some(core)),
        }))
    }

    fn release(&self) {
        if let Some(core) = self.take_core() {
            self.shared.release_core(&core);
        }
    }
}

impl Drop for FileReadWriteLease {
    fn drop(&mut self) {
        if let Some(core) = self.take_core() {
            self.shared.release_core(&core);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn create_temp_dir() -> TempDir {
        TempDir::new("tmp").expect("Failed to create temporary directory")
    }

    fn create_leaser(temp_dir: &TempDir, limit: u64) -> FileLeaser {
        FileLeaser::new("test".to_string(), temp_dir.path(), limit)
            .expect("Failed to create leaser")
    }

    fn lease_file_count(temp_dir: &TempDir) -> usize {
        fs::read_dir(temp_dir.path())
            .expect("Failed to read lease dir")
            .count()
    }

    #[test]
    fn test_write_downgrade_read() {
        let temp_dir = create_temp_dir();
        let leaser = create_leaser(&temp_dir, 1024);

        let rwl = leaser
            .new_file(4)
            .expect("Failed to allocate lease");
        assert_eq!(rwl.write(b"abcd").expect("Failed to write"), 4);
        assert_eq!(rwl.size().expect("Failed to query size"), 4);

        let lease = rwl.downgrade().expect("Failed to downgrade");
        assert_eq!(lease.size(), 4);
        assert!(!lease.revoked());

        // The cursor carries over from the writes.
        lease
            .seek(SeekFrom::Start(0))
            .expect("Failed to seek");
        let mut buf = [0u8; 4];
        assert_eq!(lease.read(&mut buf).expect("Failed to read"), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(lease.read(&mut buf).expect("Failed to read"), 0);

        let mut two = [0u8; 2];
        assert_eq!(
            lease
                .read_at(&mut two, 2)
                .expect("Failed to read_at"),
            2
        );
        assert_eq!(&two, b"cd");
    }

    #[test]
    fn test_out_of_capacity() {
        let temp_dir = create_temp_dir();
        let leaser = create_leaser(&temp_dir, 8);

        let err = leaser
            .new_file(16)
            .err()
            .expect("Expected allocation to fail");
        assert!(matches!(
            err,
            LeaseError::OutOfCapacity {
                requested: 16,
                limit: 8
            }
        ));
        assert_eq!(leaser.used_bytes(), 0);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let temp_dir = create_temp_dir();
        let leaser = create_leaser(&temp_dir, 8);

        let a = leaser
            .new_file(4)
            .expect("Failed to allocate a");
        a.write(b"aaaa").expect("Failed to write a");
        let a = a.downgrade().expect("Failed to downgrade a");

        let b = leaser
            .new_file(4)
            .expect("Failed to allocate b");
        b.write(b"bbbb").expect("Failed to write b");
        let b = b.downgrade().expect("Failed to downgrade b");

        // Touch a so that b becomes the eviction candidate.
        let mut buf = [0u8; 4];
        a.read_at(&mut buf, 0).expect("Failed to read a");

        let _c = leaser
            .new_file(4)
            .expect("Failed to allocate c");

        assert!(b.revoked());
        assert!(!a.revoked());
        assert!(matches!(b.read(&mut buf), Err(LeaseError::Revoked)));
        assert_eq!(leaser.used_bytes(), 8);
    }

    #[test]
    fn test_revoke_idempotent() {
        let temp_dir = create_temp_dir();
        let leaser = create_leaser(&temp_dir, 8);

        let rwl = leaser
            .new_file(4)
            .expect("Failed to allocate lease");
        rwl.write(b"abcd").expect("Failed to write");
        let lease = rwl.downgrade().expect("Failed to downgrade");
        assert_eq!(leaser.used_bytes(), 4);
        assert_eq!(lease_file_count(&temp_dir), 1);

        lease.revoke();
        assert_eq!(leaser.used_bytes(), 0);
        assert_eq!(lease_file_count(&temp_dir), 0);
        assert!(lease.revoked());

        lease.revoke();
        assert_eq!(leaser.used_bytes(), 0);

        let mut buf = [0u8; 4];
        assert!(matches!(lease.read(&mut buf), Err(LeaseError::Revoked)));
    }

    #[test]
    fn test_drop_releases() {
        let temp_dir = create_temp_dir();
        let leaser = create_leaser(&temp_dir, 8);

        {
            let _rwl = leaser
                .new_file(4)
                .expect("Failed to allocate lease");
            assert_eq!(leaser.used_bytes(), 4);
        }
        assert_eq!(leaser.used_bytes(), 0);
        assert_eq!(lease_file_count(&temp_dir), 0);
    }

    #[test]
    fn test_upgrade_pins_lease() {
        let temp_dir = create_temp_dir();
        let leaser = create_leaser(&temp_dir, 8);

        let rwl = leaser
            .new_file(8)
            .expect("Failed to allocate lease");
        rwl.write(b"12345678").expect("Failed to write");
        let lease = rwl.downgrade().expect("Failed to downgrade");

        let upgraded = lease.upgrade().expect("Failed to upgrade");
        assert!(lease.revoked());

        // The upgraded lease is pinned: a full-budget allocation cannot
        // evict it and goes over budget instead.
        let _other = leaser
            .new_file(8)
            .expect("Failed to allocate over budget");
        assert_eq!(leaser.used_bytes(), 16);

        assert_eq!(
            upgraded
                .seek(SeekFrom::End(0))
                .expect("Failed to seek"),
            8
        );
        assert_eq!(
            upgraded.write(b"more").expect("Failed to write"),
            4
        );
        assert_eq!(upgraded.size().expect("Failed to query size"), 12);
    }

    #[test]
    fn test_upgrade_after_eviction_fails() {
        let temp_dir = create_temp_dir();
        let leaser = create_leaser(&temp_dir, 8);

        let rwl = leaser
            .new_file(4)
            .expect("Failed to allocate lease");
        rwl.write(b"abcd").expect("Failed to write");
        let lease = rwl.downgrade().expect("Failed to downgrade");

        // Force the lease out.
        let _big = leaser
            .new_file(8)
            .expect("Failed to allocate big lease");
        assert!(lease.revoked());

        assert!(matches!(lease.upgrade(), Err(LeaseError::Revoked)));
    }

    #[test]
    fn test_seek_bounds() {
        let temp_dir = create_temp_dir();
        let leaser = create_leaser(&temp_dir, 8);

        let rwl = leaser
            .new_file(4)
            .expect("Failed to allocate lease");
        rwl.write(b"abcd").expect("Failed to write");
        let lease = rwl.downgrade().expect("Failed to downgrade");

        assert_eq!(
            lease
                .seek(SeekFrom::Start(2))
                .expect("Failed to seek"),
            2
        );
        assert_eq!(
            lease
                .seek(SeekFrom::Current(-1))
                .expect("Failed to seek"),
            1
        );
        assert_eq!(
            lease
                .seek(SeekFrom::End(-2))
                .expect("Failed to seek"),
            2
        );
        assert!(lease.seek(SeekFrom::Current(-10)).is_err());
    }
}
