//! Library entities: artists, albums, tracks.
//!
//! Forward references only (`album.artist_id`, `track.album_id`); back
//! references are reconstituted by query. External service ids live in a
//! json map so new providers never need a migration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Whether an entity belongs to the user's library.
/// Only `owned` entities participate in the download lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipState {
    Owned,
    Discovered,
    Ignored,
}

impl OwnershipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnershipState::Owned => "owned",
            OwnershipState::Discovered => "discovered",
            OwnershipState::Ignored => "ignored",
        }
    }
}

impl fmt::Display for OwnershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OwnershipState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owned" => Ok(OwnershipState::Owned),
            "discovered" => Ok(OwnershipState::Discovered),
            "ignored" => Ok(OwnershipState::Ignored),
            other => Err(format!("unknown ownership state: {other}")),
        }
    }
}

/// Per-track acquisition state, parallel to `Download.status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackDownloadState {
    NotNeeded,
    Pending,
    Downloading,
    Downloaded,
    Failed,
}

impl TrackDownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackDownloadState::NotNeeded => "not_needed",
            TrackDownloadState::Pending => "pending",
            TrackDownloadState::Downloading => "downloading",
            TrackDownloadState::Downloaded => "downloaded",
            TrackDownloadState::Failed => "failed",
        }
    }
}

impl fmt::Display for TrackDownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackDownloadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_needed" => Ok(TrackDownloadState::NotNeeded),
            "pending" => Ok(TrackDownloadState::Pending),
            "downloading" => Ok(TrackDownloadState::Downloading),
            "downloaded" => Ok(TrackDownloadState::Downloaded),
            "failed" => Ok(TrackDownloadState::Failed),
            other => Err(format!("unknown track download state: {other}")),
        }
    }
}

/// Map of provider name to that provider's stable id for an entity
pub type ExternalIds = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artist {
    pub id: Uuid,
    pub name: String,
    pub normalized_name: String,
    pub external_ids: ExternalIds,
    pub ownership_state: OwnershipState,
    pub artwork_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Album {
    pub id: Uuid,
    pub artist_id: Uuid,
    pub title: String,
    pub normalized_title: String,
    pub external_ids: ExternalIds,
    pub ownership_state: OwnershipState,
    pub artwork_url: Option<String>,
    pub release_date: Option<chrono::NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: Uuid,
    pub album_id: Uuid,
    pub artist_id: Uuid,
    pub title: String,
    pub normalized_title: String,
    pub isrc: Option<String>,
    pub track_number: Option<i32>,
    pub duration_secs: Option<i32>,
    pub external_ids: ExternalIds,
    pub ownership_state: OwnershipState,
    pub download_state: TrackDownloadState,
    /// Set once the audio exists on disk; a completed download requires it
    pub file_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Artist as imported from an external service. Only stable identifiers and
/// a small set of display fields cross this boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportedArtist {
    pub external_id: String,
    pub name: String,
    pub artwork_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportedAlbum {
    pub external_id: String,
    pub title: String,
    pub artwork_url: Option<String>,
    pub release_date: Option<chrono::NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportedTrack {
    pub external_id: String,
    pub title: String,
    pub isrc: Option<String>,
    pub track_number: Option<i32>,
    pub duration_secs: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportedPlaylist {
    pub external_id: String,
    pub name: String,
    pub artwork_url: Option<String>,
    pub track_ids: Vec<String>,
}

/// Lowercased, whitespace-collapsed, punctuation-stripped form used as a
/// stable natural key when providers disagree on spelling.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_space = true;
    for ch in name.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim_end().to_string()
}
