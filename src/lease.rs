use std::io::SeekFrom;

use data_error::Result;

/// A read-only claim on leaser-managed bytes.
///
/// Leases are internally synchronized: every method takes `&self` and may be
/// called from multiple threads. A lease stops serving operations once it is
/// revoked, either explicitly through [`ReadLease::revoke`] or by the leaser
/// evicting it to make room for another allocation; after that, operations
/// return [`data_error::LeaseError::Revoked`].
pub trait ReadLease: Send + Sync {
    /// Read from the current sequential cursor, advancing it.
    /// Returns `Ok(0)` at end of data.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Read at the given offset without disturbing the sequential cursor.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Move the sequential cursor, returning the resulting absolute offset.
    fn seek(&self, pos: SeekFrom) -> Result<u64>;

    /// The size declared for this lease's contents.
    fn size(&self) -> u64;

    /// Check whether the lease has been revoked or evicted.
    fn revoked(&self) -> bool;

    /// Convert this lease into a read/write lease. One-way: on success the
    /// read lease is permanently unusable and the storage is no longer
    /// evictable. Fails with `Revoked` if the lease is already gone.
    fn upgrade(&self) -> Result<Box<dyn ReadWriteLease>>;

    /// Voluntarily give up the lease, freeing its storage immediately.
    /// Idempotent.
    fn revoke(&self);
}

/// An exclusive, mutable claim on leaser-managed bytes.
///
/// Read/write leases count against the leaser's budget but are never evicted;
/// they end by [`ReadWriteLease::downgrade`] or [`ReadWriteLease::release`].
pub trait ReadWriteLease: Send + Sync {
    /// Write at the current sequential cursor, advancing it.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Read from the current sequential cursor, advancing it.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Read at the given offset without disturbing the sequential cursor.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Move the sequential cursor, returning the resulting absolute offset.
    fn seek(&self, pos: SeekFrom) -> Result<u64>;

    /// The current length of the written contents in bytes.
    fn size(&self) -> Result<u64>;

    /// Convert this lease into a read lease, making its storage evictable
    /// again. One-way: the read/write lease is permanently unusable
    /// afterwards. On failure the storage has been released.
    fn downgrade(&self) -> Result<Box<dyn ReadLease>>;

    /// Give up the lease, freeing its storage immediately. Idempotent.
    fn release(&self);
}
