pub mod auto_refresh;
pub mod lease;
pub mod leaser;

pub use auto_refresh::{AutoRefreshingReadLease, ContentSupplier};
pub use lease::{ReadLease, ReadWriteLease};
pub use leaser::{FileLeaser, Leaser};
