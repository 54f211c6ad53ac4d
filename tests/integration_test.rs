#[cfg(test)]
mod tests {
    use fs_lease::{
        AutoRefreshingReadLease, FileLeaser, Leaser, ReadLease, ReadWriteLease,
    };
    use std::io::{Cursor, Read, SeekFrom};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempdir::TempDir;

    #[test]
    fn test_lease_lifecycle_integration() {
        let temp_dir =
            TempDir::new("tmp").expect("Failed to create temporary directory");
        let leaser =
            FileLeaser::new("integration".to_string(), temp_dir.path(), 4096)
                .expect("Failed to create leaser");

        let size: u64 = 1024;
        let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

        let calls = Arc::new(AtomicUsize::new(0));
        let supplier_calls = Arc::clone(&calls);
        let supplier_content = content.clone();
        let view = AutoRefreshingReadLease::new(
            Box::new(leaser.clone()),
            size,
            move || {
                supplier_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(Cursor::new(supplier_content.clone()))
                    as Box<dyn Read + Send>)
            },
        );

        // Sequential read of the whole contents.
        let mut all = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = view.read(&mut buf).expect("Failed to read");
            if n == 0 {
                break;
            }
            all.extend_from_slice(&buf[..n]);
        }
        assert_eq!(all, content);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(leaser.used_bytes(), size);

        // Push the view's temporary copy out of the leaser.
        let probe = leaser
            .new_file(4096)
            .expect("Failed to allocate probe");
        probe.release();
        assert_eq!(leaser.used_bytes(), 0);

        // The view heals transparently.
        let mut chunk = [0u8; 64];
        assert_eq!(
            view.read_at(&mut chunk, 512)
                .expect("Failed to read_at"),
            64
        );
        assert_eq!(&chunk[..], &content[512..576]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!view.revoked());

        // Upgrade ends the auto-refresh magic; the storage is ours now.
        let rwl = view.upgrade().expect("Failed to upgrade");
        assert!(view.revoked());
        assert!(view.read(&mut buf).is_err());

        rwl.seek(SeekFrom::End(0)).expect("Failed to seek");
        rwl.write(b"appended").expect("Failed to write");
        assert_eq!(rwl.size().expect("Failed to query size"), size + 8);

        // Downgrade back to a plain read lease and read the appended tail.
        let lease = rwl.downgrade().expect("Failed to downgrade");
        let mut tail = [0u8; 8];
        assert_eq!(
            lease
                .read_at(&mut tail, size)
                .expect("Failed to read tail"),
            8
        );
        assert_eq!(&tail, b"appended");

        lease.revoke();
        assert_eq!(leaser.used_bytes(), 0);
    }
}
