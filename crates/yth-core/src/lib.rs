//! Core domain model, error taxonomy and run report for the channel harvester.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "yth-core";

/// Top-level publisher record. Written once per harvest run, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub subscribers: i64,
    pub views: i64,
    pub video_count: i64,
    pub description: String,
    pub uploads_playlist_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub title: String,
    pub channel_id: String,
    /// Snapshot of the owning channel's name at harvest time.
    pub channel_name: String,
    pub published_at: DateTime<Utc>,
    pub item_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub title: String,
    /// Comma-delimited tag list, empty when the video has no tags.
    pub tags: String,
    pub thumbnail_url: String,
    pub description: String,
    pub published_at: DateTime<Utc>,
    /// ISO-8601 duration exactly as the API reported it (e.g. `PT4M13S`).
    pub duration: String,
    pub views: i64,
    pub likes: i64,
    pub comment_count: i64,
    pub favorite_count: i64,
    pub definition: String,
    pub has_captions: bool,
}

/// Top-level comment on a video. The row id is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// Upstream comment id, when the API reported one.
    pub source_id: Option<String>,
    pub video_id: String,
    pub text: String,
    pub author: String,
    pub published_at: DateTime<Utc>,
}

/// One page of a cursor-paginated listing. `next_cursor == None` marks the last page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }

    pub fn with_next(items: Vec<T>, next_cursor: impl Into<String>) -> Self {
        Self {
            items,
            next_cursor: Some(next_cursor.into()),
        }
    }
}

/// Upstream resource kinds, used to give errors and skips their context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Channel,
    Playlist,
    PlaylistItems,
    Video,
    CommentThreads,
    Comment,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Channel => "channel",
            Resource::Playlist => "playlist",
            Resource::PlaylistItems => "playlist items",
            Resource::Video => "video",
            Resource::CommentThreads => "comment threads",
            Resource::Comment => "comment",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States of the ingestion state machine a run can be in when something happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CheckExisting,
    FetchChannel,
    PersistChannel,
    FetchPlaylists,
    PersistPlaylists,
    DrainUploads,
    FetchDetail,
    PersistVideo,
    FetchComments,
    PersistComments,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::CheckExisting => "check_existing",
            Stage::FetchChannel => "fetch_channel",
            Stage::PersistChannel => "persist_channel",
            Stage::FetchPlaylists => "fetch_playlists",
            Stage::PersistPlaylists => "persist_playlists",
            Stage::DrainUploads => "drain_uploads",
            Stage::FetchDetail => "fetch_detail",
            Stage::PersistVideo => "persist_video",
            Stage::FetchComments => "fetch_comments",
            Stage::PersistComments => "persist_comments",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HarvestError {
    #[error("{resource} {id} unavailable after {attempts} attempt(s): {reason}")]
    UpstreamUnavailable {
        resource: Resource,
        id: String,
        attempts: usize,
        reason: String,
    },
    #[error("{resource} {id} not found")]
    NotFound { resource: Resource, id: String },
    #[error("malformed {resource} {id}: {reason}")]
    MalformedResponse {
        resource: Resource,
        id: String,
        reason: String,
    },
    #[error("{entity} {id} references uncommitted parent {parent_id}")]
    ForeignKeyViolation {
        entity: Resource,
        id: String,
        parent_id: String,
    },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl HarvestError {
    pub fn malformed(resource: Resource, id: impl Into<String>, reason: impl Into<String>) -> Self {
        HarvestError::MalformedResponse {
            resource,
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(resource: Resource, id: impl Into<String>) -> Self {
        HarvestError::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Whether a failure on a leaf record (video, comment page, comment) may be
    /// recorded and skipped. Ordering defects and storage outages always abort.
    pub fn is_leaf_recoverable(&self) -> bool {
        matches!(
            self,
            HarvestError::UpstreamUnavailable { .. }
                | HarvestError::NotFound { .. }
                | HarvestError::MalformedResponse { .. }
        )
    }
}

/// A fatal failure, surfaced with the channel and the stage the run died in.
#[derive(Debug, Error)]
#[error("harvest of channel {channel_id} aborted at {stage}: {source}")]
pub struct RunError {
    pub channel_id: String,
    pub stage: Stage,
    #[source]
    pub source: HarvestError,
}

impl RunError {
    pub fn new(channel_id: impl Into<String>, stage: Stage, source: HarvestError) -> Self {
        Self {
            channel_id: channel_id.into(),
            stage,
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestOutcome {
    Completed,
    /// The channel was already stored; nothing was fetched or written.
    SkippedDuplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafKind {
    Video,
    CommentPage,
    Comment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedLeaf {
    pub kind: LeafKind,
    pub id: String,
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestReport {
    pub run_id: Uuid,
    pub channel_id: String,
    pub outcome: HarvestOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub channels: u64,
    pub playlists: u64,
    pub videos: u64,
    pub comments: u64,
    pub skipped: Vec<SkippedLeaf>,
}

impl HarvestReport {
    pub fn new(run_id: Uuid, channel_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            channel_id: channel_id.into(),
            outcome: HarvestOutcome::Completed,
            started_at,
            finished_at: started_at,
            channels: 0,
            playlists: 0,
            videos: 0,
            comments: 0,
            skipped: Vec::new(),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.outcome == HarvestOutcome::SkippedDuplicate
    }

    pub fn skipped_ids(&self) -> Vec<&str> {
        self.skipped.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn summary_line(&self) -> String {
        match self.outcome {
            HarvestOutcome::SkippedDuplicate => format!(
                "channel {} already harvested; nothing to do (run_id={})",
                self.channel_id, self.run_id
            ),
            HarvestOutcome::Completed => format!(
                "harvest complete: run_id={} channel={} channels={} playlists={} videos={} comments={} skipped={}",
                self.run_id,
                self.channel_id,
                self.channels,
                self.playlists,
                self.videos,
                self.comments,
                self.skipped.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_upstream_and_shape_failures_are_leaf_recoverable() {
        assert!(HarvestError::not_found(Resource::Video, "v1").is_leaf_recoverable());
        assert!(HarvestError::malformed(Resource::Comment, "v1", "bad ts").is_leaf_recoverable());
        assert!(HarvestError::UpstreamUnavailable {
            resource: Resource::CommentThreads,
            id: "v1".into(),
            attempts: 4,
            reason: "http 503".into(),
        }
        .is_leaf_recoverable());

        assert!(!HarvestError::StorageUnavailable("pool closed".into()).is_leaf_recoverable());
        assert!(!HarvestError::ForeignKeyViolation {
            entity: Resource::Video,
            id: "v1".into(),
            parent_id: "UC_x".into(),
        }
        .is_leaf_recoverable());
    }

    #[test]
    fn run_error_names_channel_and_stage() {
        let err = RunError::new(
            "UC_test",
            Stage::FetchChannel,
            HarvestError::not_found(Resource::Channel, "UC_test"),
        );
        assert_eq!(
            err.to_string(),
            "harvest of channel UC_test aborted at fetch_channel: channel UC_test not found"
        );
    }

    #[test]
    fn report_serializes_outcome_and_skips_in_snake_case() {
        let started = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let mut report = HarvestReport::new(Uuid::nil(), "UC_test", started);
        report.skipped.push(SkippedLeaf {
            kind: LeafKind::CommentPage,
            id: "v4".into(),
            stage: Stage::FetchComments,
            reason: "comment threads v4 not found".into(),
        });

        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["outcome"], "completed");
        assert_eq!(json["skipped"][0]["kind"], "comment_page");
        assert_eq!(json["skipped"][0]["stage"], "fetch_comments");
        assert_eq!(report.skipped_ids(), vec!["v4"]);
    }
}
