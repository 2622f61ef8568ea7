//! Contracts for external music catalogues.
//!
//! One `ImportSource` per streaming service; the coordinator iterates over
//! whatever sources are registered and never knows vendor details. DTOs
//! carry stable identifiers and a small set of display fields only.
//!
//! Imports are paginated upstream and potentially large, so they surface as
//! a lazy stream of batches rather than one whole-catalogue list.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::models::library::{
    Album, Artist, ImportedAlbum, ImportedArtist, ImportedPlaylist, ImportedTrack,
};

/// A finite stream of import batches; `None` from the stream is end-of-data
pub type ImportStream<'a, T> = BoxStream<'a, Result<Vec<T>>>;

/// One external music service the user follows artists on
#[async_trait]
pub trait ImportSource: Send + Sync {
    /// Stable provider name, also the key under `external_ids`
    fn name(&self) -> &str;

    async fn is_available(&self) -> bool;

    /// The user's followed artists, in batches
    async fn import_artists(&self) -> Result<ImportStream<'_, ImportedArtist>>;

    async fn import_albums_for_artist(
        &self,
        artist_external_id: &str,
        artist_name: Option<&str>,
    ) -> Result<Vec<ImportedAlbum>>;

    async fn import_tracks_for_album(&self, album_external_id: &str)
        -> Result<Vec<ImportedTrack>>;

    async fn import_playlists(&self) -> Result<Vec<ImportedPlaylist>>;
}

/// Metadata attached to an artist by an enrichment provider
#[derive(Debug, Clone, Default)]
pub struct ArtistEnrichment {
    pub artwork_url: Option<String>,
}

/// Metadata attached to an album by an enrichment provider
#[derive(Debug, Clone, Default)]
pub struct AlbumEnrichment {
    pub artwork_url: Option<String>,
}

/// A provider consulted during the enrichment task. Providers are tried in
/// registration order; the first one returning data for an entity wins.
#[async_trait]
pub trait MetadataEnricher: Send + Sync {
    fn name(&self) -> &str;

    async fn enrich_artist(&self, artist: &Artist) -> Result<Option<ArtistEnrichment>>;

    async fn enrich_album(&self, album: &Album) -> Result<Option<AlbumEnrichment>>;
}
