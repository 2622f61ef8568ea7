//! Domain entities and value objects.

pub mod blocklist;
pub mod download;
pub mod error_codes;
pub mod library;
pub mod session;
pub mod token;
pub mod work_item;

pub use blocklist::{BlocklistEntry, BlocklistScope};
pub use download::{Download, DownloadStatus};
pub use error_codes::{DownloadErrorCode, Retryability};
pub use library::{
    normalize_name, Album, Artist, ExternalIds, ImportedAlbum, ImportedArtist, ImportedPlaylist,
    ImportedTrack, OwnershipState, Track, TrackDownloadState,
};
pub use session::{generate_session_id, PkcePair, Session};
pub use token::{ServiceKind, ServiceToken, TokenResponse};
pub use work_item::{retry_backoff, NewWorkItem, WorkItem, WorkItemStatus, WorkItemType};
