use std::io::{self, Read, SeekFrom};
use std::sync::Mutex;

use data_error::{LeaseError, Result};

use crate::lease::{ReadLease, ReadWriteLease};
use crate::leaser::Leaser;

/// Source of lease contents. Every invocation must yield a stream with the
/// same bytes, of exactly the size declared to
/// [`AutoRefreshingReadLease::new`].
pub type ContentSupplier = Box<dyn FnMut() -> Result<Box<dyn Read + Send>> + Send>;

/// A read lease that never expires unless voluntarily revoked or upgraded.
///
/// The supplier is used to obtain the lease contents the first time and
/// whenever the leaser decides to evict the temporary copy thus obtained, so
/// callers never observe an eviction-caused failure. Regeneration restarts
/// the sequential cursor at offset zero.
///
/// All operations serialize on one lock per lease, supplier invocation and
/// allocation included: of N concurrent callers hitting an evicted lease,
/// exactly one regenerates while the rest wait.
pub struct AutoRefreshingReadLease {
    /// Declared content size, presented unconditionally by `size()`
    size: u64,
    leaser: Box<dyn Leaser>,
    inner: Mutex<Inner>,
}

struct Inner {
    supplier: ContentSupplier,
    /// The current wrapped lease, or None if one has never been issued
    /// or the last one was discarded after eviction.
    wrapped: Option<Box<dyn ReadLease>>,
    /// Set by revoke() or a successful upgrade(); never cleared.
    revoked: bool,
}

/// The lease an accessor is delegated to: the saved read lease when it is
/// still live, or the freshly filled read/write lease during regeneration.
enum Backing<'a> {
    Wrapped(&'a dyn ReadLease),
    Fresh(&'a dyn ReadWriteLease),
}

impl Backing<'_> {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Backing::Wrapped(lease) => lease.read(buf),
            Backing::Fresh(lease) => lease.read(buf),
        }
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self {
            Backing::Wrapped(lease) => lease.read_at(buf, offset),
            Backing::Fresh(lease) => lease.read_at(buf, offset),
        }
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64> {
        match self {
            Backing::Wrapped(lease) => lease.seek(pos),
            Backing::Fresh(lease) => lease.seek(pos),
        }
    }
}

impl AutoRefreshingReadLease {
    /// Create an auto-refreshing lease over `supplier`, which must yield
    /// streams of exactly `size` bytes with identical contents every time.
    pub fn new<F>(leaser: Box<dyn Leaser>, size: u64, supplier: F) -> Self
    where
        F: FnMut() -> Result<Box<dyn Read + Send>> + Send + 'static,
    {
        Self {
            size,
            leaser,
            inner: Mutex::new(Inner {
                supplier: Box::new(supplier),
                wrapped: None,
                revoked: false,
            }),
        }
    }

    /// Set up a read/write lease filled with fresh contents from the
    /// supplier, positioned at the start.
    ///
    /// On any failure the half-filled lease has been released and nothing
    /// is stored; the next access retries from scratch.
    fn get_contents(&self, inner: &mut Inner) -> Result<Box<dyn ReadWriteLease>> {
        let stream = (inner.supplier)()
            .map_err(|err| LeaseError::Supplier(err.to_string()))?;

        let rwl = self.leaser.new_file(self.size)?;

        // Consume the stream to its end so an over-long supplier is
        // detected, not just a short one.
        let copied = fill(stream, rwl.as_ref())?;
        if copied != self.size {
            return Err(LeaseError::ContentLengthMismatch {
                expected: self.size,
                actual: copied,
            });
        }

        rwl.seek(SeekFrom::Start(0))?;
        Ok(rwl)
    }

    /// Downgrade and save the supplied read/write lease obtained with
    /// `get_contents` for later use. A downgrade failure is not an error
    /// for the caller, whose operation has already been served from the
    /// read/write lease; the slot stays empty and the next access
    /// regenerates.
    fn save_contents(&self, inner: &mut Inner, rwl: Box<dyn ReadWriteLease>) {
        match rwl.downgrade() {
            Ok(lease) => inner.wrapped = Some(lease),
            Err(err) => {
                log::warn!("auto-refreshing lease: downgrade failed: {}", err)
            }
        }
    }

    /// Run `op` against a live backing lease, regenerating the contents
    /// first if there is no wrapped lease or it has been evicted.
    fn access<T>(
        &self,
        mut op: impl FnMut(Backing<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.lock().unwrap();
        if inner.revoked {
            return Err(LeaseError::Revoked);
        }

        // Common case: the existing lease is still valid.
        if let Some(wrapped) = &inner.wrapped {
            if !wrapped.revoked() {
                match op(Backing::Wrapped(wrapped.as_ref())) {
                    // Evicted between the check and the delegate call;
                    // fall through and regenerate.
                    Err(LeaseError::Revoked) => {}
                    result => return result,
                }
            }
        }
        inner.wrapped = None;

        let rwl = self.get_contents(&mut inner)?;
        let result = op(Backing::Fresh(rwl.as_ref()));
        self.save_contents(&mut inner, rwl);
        result
    }
}

impl ReadLease for AutoRefreshingReadLease {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.access(|lease| lease.read(buf))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.access(|lease| lease.read_at(buf, offset))
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64> {
        self.access(|lease| lease.seek(pos))
    }

    fn size(&self) -> u64 {
        self.size
    }

    /// True only after `revoke()` or a successful `upgrade()`. Evictions of
    /// the temporary copy are healed transparently and never show up here.
    fn revoked(&self) -> bool {
        self.inner.lock().unwrap().revoked
    }

    /// Hand the backing storage to the caller as a read/write lease,
    /// permanently ending the auto-refresh behavior. If the upgrade fails,
    /// the lease stays usable.
    fn upgrade(&self) -> Result<Box<dyn ReadWriteLease>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.revoked {
            return Err(LeaseError::Revoked);
        }

        let rwl = match inner.wrapped.take() {
            Some(wrapped) if !wrapped.revoked() => match wrapped.upgrade() {
                Ok(rwl) => rwl,
                // Eviction raced us; regenerate and hand over the fresh
                // read/write lease directly.
                Err(LeaseError::Revoked) => self.get_contents(&mut inner)?,
                Err(err) => return Err(err),
            },
            _ => self.get_contents(&mut inner)?,
        };

        inner.revoked = true;
        Ok(rwl)
    }

    fn revoke(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.revoked {
            return;
        }
        inner.revoked = true;
        if let Some(wrapped) = inner.wrapped.take() {
            wrapped.revoke();
        }
    }
}

/// Copy the whole stream into the lease, returning the number of bytes
/// copied.
fn fill(mut stream: Box<dyn Read + Send>, rwl: &dyn ReadWriteLease) -> Result<u64> {
    let mut buf = [0u8; 8192];
    let mut copied: u64 = 0;

    loop {
        let n = stream
            .read(&mut buf)
            .map_err(|err| LeaseError::Supplier(err.to_string()))?;
        if n == 0 {
            return Ok(copied);
        }

        let mut written = 0;
        while written < n {
            let w = rwl.write(&buf[written..n])?;
            if w == 0 {
                return Err(LeaseError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write lease contents",
                )));
            }
            written += w;
        }
        copied += n as u64;
    }
}
