//! Persistence for library entities (artists, albums, tracks).
//!
//! All writes are upserts on stable natural keys (provider id, ISRC, or a
//! normalized name tuple) so re-running any sync task is idempotent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::library::{
    normalize_name, Album, Artist, ImportedAlbum, ImportedArtist, ImportedTrack, OwnershipState,
    Track, TrackDownloadState,
};

/// Aggregate library size, reported through the status endpoint
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LibraryStats {
    pub artists: i64,
    pub albums: i64,
    pub tracks: i64,
    pub tracks_with_files: i64,
}

#[async_trait]
pub trait LibraryStore: Send + Sync {
    /// Upsert by provider id, falling back to the normalized name.
    /// Discovery never downgrades an `owned` artist.
    async fn upsert_artist(
        &self,
        source: &str,
        artist: &ImportedArtist,
        ownership: OwnershipState,
    ) -> Result<Artist>;

    async fn upsert_album(
        &self,
        source: &str,
        artist_id: Uuid,
        album: &ImportedAlbum,
    ) -> Result<Album>;

    /// Returns the track and whether it was newly created
    async fn upsert_track(
        &self,
        source: &str,
        album_id: Uuid,
        artist_id: Uuid,
        track: &ImportedTrack,
    ) -> Result<(Track, bool)>;

    async fn owned_artists(&self, limit: i64) -> Result<Vec<Artist>>;
    async fn owned_albums(&self, limit: i64) -> Result<Vec<Album>>;

    async fn artists_missing_artwork(&self, limit: i64) -> Result<Vec<Artist>>;
    async fn albums_missing_artwork(&self, limit: i64) -> Result<Vec<Album>>;
    async fn set_artist_artwork(&self, artist_id: Uuid, url: &str) -> Result<()>;
    async fn set_album_artwork(&self, album_id: Uuid, url: &str) -> Result<()>;

    async fn get_track(&self, track_id: Uuid) -> Result<Option<Track>>;
    async fn tracks_pending_download(&self, limit: i64) -> Result<Vec<Track>>;
    async fn set_track_download_state(
        &self,
        track_id: Uuid,
        state: TrackDownloadState,
    ) -> Result<()>;

    /// Record the on-disk file for a track and mark it downloaded
    async fn set_track_file(&self, track_id: Uuid, file_path: &str) -> Result<()>;

    /// Delete albums with no tracks, then artists with no albums and no
    /// tracks. Returns `(albums_deleted, artists_deleted)`.
    async fn purge_orphans(&self) -> Result<(u64, u64)>;

    async fn stats(&self) -> Result<LibraryStats>;
}

#[derive(sqlx::FromRow)]
struct ArtistRow {
    id: Uuid,
    name: String,
    normalized_name: String,
    external_ids: serde_json::Value,
    ownership_state: String,
    artwork_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ArtistRow> for Artist {
    type Error = AppError;

    fn try_from(row: ArtistRow) -> Result<Artist> {
        Ok(Artist {
            id: row.id,
            name: row.name,
            normalized_name: row.normalized_name,
            external_ids: serde_json::from_value(row.external_ids)
                .map_err(|e| AppError::Internal(format!("bad external_ids json: {e}")))?,
            ownership_state: row.ownership_state.parse().map_err(AppError::Internal)?,
            artwork_url: row.artwork_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AlbumRow {
    id: Uuid,
    artist_id: Uuid,
    title: String,
    normalized_title: String,
    external_ids: serde_json::Value,
    ownership_state: String,
    artwork_url: Option<String>,
    release_date: Option<chrono::NaiveDate>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AlbumRow> for Album {
    type Error = AppError;

    fn try_from(row: AlbumRow) -> Result<Album> {
        Ok(Album {
            id: row.id,
            artist_id: row.artist_id,
            title: row.title,
            normalized_title: row.normalized_title,
            external_ids: serde_json::from_value(row.external_ids)
                .map_err(|e| AppError::Internal(format!("bad external_ids json: {e}")))?,
            ownership_state: row.ownership_state.parse().map_err(AppError::Internal)?,
            artwork_url: row.artwork_url,
            release_date: row.release_date,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TrackRow {
    id: Uuid,
    album_id: Uuid,
    artist_id: Uuid,
    title: String,
    normalized_title: String,
    isrc: Option<String>,
    track_number: Option<i32>,
    duration_secs: Option<i32>,
    external_ids: serde_json::Value,
    ownership_state: String,
    download_state: String,
    file_path: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TrackRow> for Track {
    type Error = AppError;

    fn try_from(row: TrackRow) -> Result<Track> {
        Ok(Track {
            id: row.id,
            album_id: row.album_id,
            artist_id: row.artist_id,
            title: row.title,
            normalized_title: row.normalized_title,
            isrc: row.isrc,
            track_number: row.track_number,
            duration_secs: row.duration_secs,
            external_ids: serde_json::from_value(row.external_ids)
                .map_err(|e| AppError::Internal(format!("bad external_ids json: {e}")))?,
            ownership_state: row.ownership_state.parse().map_err(AppError::Internal)?,
            download_state: row.download_state.parse().map_err(AppError::Internal)?,
            file_path: row.file_path,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const ARTIST_COLUMNS: &str =
    "id, name, normalized_name, external_ids, ownership_state, artwork_url, created_at, updated_at";
const ALBUM_COLUMNS: &str = "id, artist_id, title, normalized_title, external_ids, \
     ownership_state, artwork_url, release_date, created_at, updated_at";
const TRACK_COLUMNS: &str = "id, album_id, artist_id, title, normalized_title, isrc, \
     track_number, duration_secs, external_ids, ownership_state, download_state, file_path, \
     created_at, updated_at";

pub struct PgLibraryStore {
    pool: PgPool,
}

impl PgLibraryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn id_patch(source: &str, external_id: &str) -> serde_json::Value {
        serde_json::json!({ source: external_id })
    }
}

#[async_trait]
impl LibraryStore for PgLibraryStore {
    async fn upsert_artist(
        &self,
        source: &str,
        artist: &ImportedArtist,
        ownership: OwnershipState,
    ) -> Result<Artist> {
        let normalized = normalize_name(&artist.name);
        let mut tx = self.pool.begin().await?;

        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM artists \
             WHERE external_ids->>$1 = $2 OR normalized_name = $3 \
             ORDER BY (external_ids->>$1 = $2) DESC \
             LIMIT 1 \
             FOR UPDATE",
        )
        .bind(source)
        .bind(&artist.external_id)
        .bind(&normalized)
        .fetch_optional(&mut *tx)
        .await?;

        let row: ArtistRow = if let Some((id,)) = existing {
            sqlx::query_as(&format!(
                "UPDATE artists SET \
                     external_ids = external_ids || $2, \
                     artwork_url = COALESCE(artwork_url, $3), \
                     ownership_state = CASE WHEN ownership_state = 'owned' THEN 'owned' ELSE $4 END, \
                     updated_at = NOW() \
                 WHERE id = $1 \
                 RETURNING {ARTIST_COLUMNS}"
            ))
            .bind(id)
            .bind(Self::id_patch(source, &artist.external_id))
            .bind(&artist.artwork_url)
            .bind(ownership.as_str())
            .fetch_one(&mut *tx)
            .await?
        } else {
            sqlx::query_as(&format!(
                "INSERT INTO artists \
                 (id, name, normalized_name, external_ids, ownership_state, artwork_url, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW()) \
                 RETURNING {ARTIST_COLUMNS}"
            ))
            .bind(Uuid::new_v4())
            .bind(&artist.name)
            .bind(&normalized)
            .bind(Self::id_patch(source, &artist.external_id))
            .bind(ownership.as_str())
            .bind(&artist.artwork_url)
            .fetch_one(&mut *tx)
            .await?
        };

        tx.commit().await?;
        row.try_into()
    }

    async fn upsert_album(
        &self,
        source: &str,
        artist_id: Uuid,
        album: &ImportedAlbum,
    ) -> Result<Album> {
        let normalized = normalize_name(&album.title);
        let mut tx = self.pool.begin().await?;

        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM albums \
             WHERE external_ids->>$1 = $2 \
                OR (artist_id = $3 AND normalized_title = $4) \
             ORDER BY (external_ids->>$1 = $2) DESC \
             LIMIT 1 \
             FOR UPDATE",
        )
        .bind(source)
        .bind(&album.external_id)
        .bind(artist_id)
        .bind(&normalized)
        .fetch_optional(&mut *tx)
        .await?;

        let row: AlbumRow = if let Some((id,)) = existing {
            sqlx::query_as(&format!(
                "UPDATE albums SET \
                     external_ids = external_ids || $2, \
                     artwork_url = COALESCE(artwork_url, $3), \
                     release_date = COALESCE(release_date, $4), \
                     updated_at = NOW() \
                 WHERE id = $1 \
                 RETURNING {ALBUM_COLUMNS}"
            ))
            .bind(id)
            .bind(Self::id_patch(source, &album.external_id))
            .bind(&album.artwork_url)
            .bind(album.release_date)
            .fetch_one(&mut *tx)
            .await?
        } else {
            sqlx::query_as(&format!(
                "INSERT INTO albums \
                 (id, artist_id, title, normalized_title, external_ids, ownership_state, \
                  artwork_url, release_date, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, 'owned', $6, $7, NOW(), NOW()) \
                 RETURNING {ALBUM_COLUMNS}"
            ))
            .bind(Uuid::new_v4())
            .bind(artist_id)
            .bind(&album.title)
            .bind(&normalized)
            .bind(Self::id_patch(source, &album.external_id))
            .bind(&album.artwork_url)
            .bind(album.release_date)
            .fetch_one(&mut *tx)
            .await?
        };

        tx.commit().await?;
        row.try_into()
    }

    async fn upsert_track(
        &self,
        source: &str,
        album_id: Uuid,
        artist_id: Uuid,
        track: &ImportedTrack,
    ) -> Result<(Track, bool)> {
        let normalized = normalize_name(&track.title);
        let mut tx = self.pool.begin().await?;

        // ISRC is the strongest key; fall back to position within the album
        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM tracks \
             WHERE external_ids->>$1 = $2 \
                OR ($3::text IS NOT NULL AND isrc = $3) \
                OR (album_id = $4 AND normalized_title = $5 \
                    AND track_number IS NOT DISTINCT FROM $6) \
             ORDER BY (external_ids->>$1 = $2) DESC \
             LIMIT 1 \
             FOR UPDATE",
        )
        .bind(source)
        .bind(&track.external_id)
        .bind(&track.isrc)
        .bind(album_id)
        .bind(&normalized)
        .bind(track.track_number)
        .fetch_optional(&mut *tx)
        .await?;

        let (row, created): (TrackRow, bool) = if let Some((id,)) = existing {
            let row = sqlx::query_as(&format!(
                "UPDATE tracks SET \
                     external_ids = external_ids || $2, \
                     isrc = COALESCE(isrc, $3), \
                     track_number = COALESCE(track_number, $4), \
                     duration_secs = COALESCE(duration_secs, $5), \
                     updated_at = NOW() \
                 WHERE id = $1 \
                 RETURNING {TRACK_COLUMNS}"
            ))
            .bind(id)
            .bind(Self::id_patch(source, &track.external_id))
            .bind(&track.isrc)
            .bind(track.track_number)
            .bind(track.duration_secs)
            .fetch_one(&mut *tx)
            .await?;
            (row, false)
        } else {
            let row = sqlx::query_as(&format!(
                "INSERT INTO tracks \
                 (id, album_id, artist_id, title, normalized_title, isrc, track_number, \
                  duration_secs, external_ids, ownership_state, download_state, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'owned', 'not_needed', NOW(), NOW()) \
                 RETURNING {TRACK_COLUMNS}"
            ))
            .bind(Uuid::new_v4())
            .bind(album_id)
            .bind(artist_id)
            .bind(&track.title)
            .bind(&normalized)
            .bind(&track.isrc)
            .bind(track.track_number)
            .bind(track.duration_secs)
            .bind(Self::id_patch(source, &track.external_id))
            .fetch_one(&mut *tx)
            .await?;
            (row, true)
        };

        tx.commit().await?;
        Ok((row.try_into()?, created))
    }

    async fn owned_artists(&self, limit: i64) -> Result<Vec<Artist>> {
        let rows: Vec<ArtistRow> = sqlx::query_as(&format!(
            "SELECT {ARTIST_COLUMNS} FROM artists \
             WHERE ownership_state = 'owned' ORDER BY updated_at ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn owned_albums(&self, limit: i64) -> Result<Vec<Album>> {
        let rows: Vec<AlbumRow> = sqlx::query_as(&format!(
            "SELECT {ALBUM_COLUMNS} FROM albums \
             WHERE ownership_state = 'owned' ORDER BY updated_at ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn artists_missing_artwork(&self, limit: i64) -> Result<Vec<Artist>> {
        let rows: Vec<ArtistRow> = sqlx::query_as(&format!(
            "SELECT {ARTIST_COLUMNS} FROM artists \
             WHERE artwork_url IS NULL AND ownership_state != 'ignored' \
             ORDER BY created_at ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn albums_missing_artwork(&self, limit: i64) -> Result<Vec<Album>> {
        let rows: Vec<AlbumRow> = sqlx::query_as(&format!(
            "SELECT {ALBUM_COLUMNS} FROM albums \
             WHERE artwork_url IS NULL AND ownership_state != 'ignored' \
             ORDER BY created_at ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_artist_artwork(&self, artist_id: Uuid, url: &str) -> Result<()> {
        sqlx::query("UPDATE artists SET artwork_url = $2, updated_at = NOW() WHERE id = $1")
            .bind(artist_id)
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_album_artwork(&self, album_id: Uuid, url: &str) -> Result<()> {
        sqlx::query("UPDATE albums SET artwork_url = $2, updated_at = NOW() WHERE id = $1")
            .bind(album_id)
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_track(&self, track_id: Uuid) -> Result<Option<Track>> {
        let row: Option<TrackRow> =
            sqlx::query_as(&format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id = $1"))
                .bind(track_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn tracks_pending_download(&self, limit: i64) -> Result<Vec<Track>> {
        let rows: Vec<TrackRow> = sqlx::query_as(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks \
             WHERE download_state = 'pending' AND file_path IS NULL \
             ORDER BY created_at ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_track_download_state(
        &self,
        track_id: Uuid,
        state: TrackDownloadState,
    ) -> Result<()> {
        let updated =
            sqlx::query("UPDATE tracks SET download_state = $2, updated_at = NOW() WHERE id = $1")
                .bind(track_id)
                .bind(state.as_str())
                .execute(&self.pool)
                .await?;
        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound {
                resource: format!("track {track_id}"),
            });
        }
        Ok(())
    }

    async fn set_track_file(&self, track_id: Uuid, file_path: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE tracks SET file_path = $2, download_state = 'downloaded', updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(track_id)
        .bind(file_path)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(AppError::NotFound {
                resource: format!("track {track_id}"),
            });
        }
        Ok(())
    }

    async fn purge_orphans(&self) -> Result<(u64, u64)> {
        let mut tx = self.pool.begin().await?;

        let albums = sqlx::query(
            "DELETE FROM albums a \
             WHERE NOT EXISTS (SELECT 1 FROM tracks t WHERE t.album_id = a.id)",
        )
        .execute(&mut *tx)
        .await?;

        let artists = sqlx::query(
            "DELETE FROM artists ar \
             WHERE NOT EXISTS (SELECT 1 FROM albums al WHERE al.artist_id = ar.id) \
               AND NOT EXISTS (SELECT 1 FROM tracks t WHERE t.artist_id = ar.id)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((albums.rows_affected(), artists.rows_affected()))
    }

    async fn stats(&self) -> Result<LibraryStats> {
        let row: (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT \
                 (SELECT COUNT(*) FROM artists), \
                 (SELECT COUNT(*) FROM albums), \
                 (SELECT COUNT(*) FROM tracks), \
                 (SELECT COUNT(*) FROM tracks WHERE file_path IS NOT NULL)",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(LibraryStats {
            artists: row.0,
            albums: row.1,
            tracks: row.2,
            tracks_with_files: row.3,
        })
    }
}
