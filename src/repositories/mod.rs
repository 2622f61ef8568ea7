//! Repository boundary between the domain and the relational store.
//!
//! Workers only mutate persistent state through these traits; the Postgres
//! implementations live next to each trait, in-memory fakes live with the
//! tests.

pub mod blocklist;
pub mod downloads;
pub mod library;
pub mod tokens;
pub mod work_items;

pub use blocklist::{BlocklistStore, PgBlocklistStore};
pub use downloads::{DownloadCount, DownloadStore, FailureGroup, PgDownloadStore};
pub use library::{LibraryStats, LibraryStore, PgLibraryStore};
pub use tokens::{PgSettingsStore, PgTokenStore, SettingsStore, TokenStore};
pub use work_items::{PgWorkItemStore, QueueDepth, WorkItemFilter, WorkItemStore};
