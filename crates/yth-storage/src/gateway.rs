//! Persistence gateway: idempotent writes for channels, playlists, videos and comments.
//!
//! Both implementations enforce the same ordering rules: playlists and videos need
//! their channel committed first, comments need their video. Duplicate primary keys
//! are no-ops, never errors.

use std::collections::{BTreeMap, HashSet};

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tokio::sync::Mutex;
use yth_core::{Channel, Comment, HarvestError, Playlist, Resource, Video};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelCounts {
    pub playlists: u64,
    pub videos: u64,
    pub comments: u64,
}

#[async_trait]
pub trait HarvestStore: Send + Sync {
    async fn channel_exists(&self, channel_id: &str) -> Result<bool, HarvestError>;

    /// Returns `false` when the channel row already existed.
    async fn upsert_channel(&self, channel: &Channel) -> Result<bool, HarvestError>;

    /// Writes one page of playlists atomically; returns how many rows were new.
    async fn upsert_playlists(&self, playlists: &[Playlist]) -> Result<u64, HarvestError>;

    /// Returns `false` when the video row already existed.
    async fn upsert_video(&self, video: &Video) -> Result<bool, HarvestError>;

    /// Appends one page of comments atomically; returns how many rows were new.
    async fn insert_comments(&self, comments: &[Comment]) -> Result<u64, HarvestError>;

    async fn counts_for_channel(&self, channel_id: &str) -> Result<ChannelCounts, HarvestError>;
}

/// Dedup key for a comment row.
///
/// Built from the upstream comment id when there is one. Only comments without an
/// id fall back to their content (video, author, timestamp, text).
pub fn comment_key(comment: &Comment) -> String {
    let published;
    let parts: Vec<&str> = match comment.source_id.as_deref() {
        Some(id) => vec!["id", comment.video_id.as_str(), id],
        None => {
            published = comment.published_at.to_rfc3339();
            vec![
                "content",
                comment.video_id.as_str(),
                comment.author.as_str(),
                published.as_str(),
                comment.text.as_str(),
            ]
        }
    };

    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

fn map_db_error(entity: Resource, id: &str, parent_id: &str, err: sqlx::Error) -> HarvestError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_foreign_key_violation() {
            return HarvestError::ForeignKeyViolation {
                entity,
                id: id.to_string(),
                parent_id: parent_id.to_string(),
            };
        }
    }
    HarvestError::StorageUnavailable(err.to_string())
}

fn storage_error(err: sqlx::Error) -> HarvestError {
    HarvestError::StorageUnavailable(err.to_string())
}

#[derive(Debug, Clone)]
pub struct PgHarvestStore {
    pool: PgPool,
}

impl PgHarvestStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying harvest schema migrations")
    }
}

#[async_trait]
impl HarvestStore for PgHarvestStore {
    async fn channel_exists(&self, channel_id: &str) -> Result<bool, HarvestError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM channel_details WHERE channel_id = $1)",
        )
        .bind(channel_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)
    }

    async fn upsert_channel(&self, channel: &Channel) -> Result<bool, HarvestError> {
        let result = sqlx::query(
            r#"
            INSERT INTO channel_details
                (channel_id, channel_name, subscribers, views, total_videos,
                 channel_description, playlist_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (channel_id) DO NOTHING
            "#,
        )
        .bind(&channel.id)
        .bind(&channel.name)
        .bind(channel.subscribers)
        .bind(channel.views)
        .bind(channel.video_count)
        .bind(&channel.description)
        .bind(channel.uploads_playlist_id.as_deref())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn upsert_playlists(&self, playlists: &[Playlist]) -> Result<u64, HarvestError> {
        let Some(first) = playlists.first() else {
            return Ok(0);
        };

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO playlist_information \
             (playlist_id, title, channel_id, channel_name, published_at, video_count) ",
        );
        builder.push_values(playlists, |mut row, p| {
            row.push_bind(&p.id)
                .push_bind(&p.title)
                .push_bind(&p.channel_id)
                .push_bind(&p.channel_name)
                .push_bind(p.published_at)
                .push_bind(p.item_count);
        });
        builder.push(" ON CONFLICT (playlist_id) DO NOTHING");

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|err| map_db_error(Resource::Playlist, &first.id, &first.channel_id, err))?;
        Ok(result.rows_affected())
    }

    async fn upsert_video(&self, video: &Video) -> Result<bool, HarvestError> {
        let result = sqlx::query(
            r#"
            INSERT INTO videoinformation
                (video_id, channel_name, channel_id, title, tags, thumbnail, description,
                 published_date, duration, views, likes, comments, favorite_count,
                 definition, caption_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (video_id) DO NOTHING
            "#,
        )
        .bind(&video.id)
        .bind(&video.channel_name)
        .bind(&video.channel_id)
        .bind(&video.title)
        .bind(&video.tags)
        .bind(&video.thumbnail_url)
        .bind(&video.description)
        .bind(video.published_at)
        .bind(&video.duration)
        .bind(video.views)
        .bind(video.likes)
        .bind(video.comment_count)
        .bind(video.favorite_count)
        .bind(&video.definition)
        .bind(video.has_captions)
        .execute(&self.pool)
        .await
        .map_err(|err| map_db_error(Resource::Video, &video.id, &video.channel_id, err))?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_comments(&self, comments: &[Comment]) -> Result<u64, HarvestError> {
        let mut seen = HashSet::new();
        let keyed = comments
            .iter()
            .map(|c| (comment_key(c), c))
            .filter(|(key, _)| seen.insert(key.clone()))
            .collect::<Vec<_>>();
        let Some((_, first)) = keyed.first() else {
            return Ok(0);
        };
        let video_id = first.video_id.clone();

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO comment_information \
             (video_id, source_comment_id, comment_text, comment_author, \
              comment_published_date, comment_key) ",
        );
        builder.push_values(&keyed, |mut row, (key, c)| {
            row.push_bind(&c.video_id)
                .push_bind(c.source_id.as_deref())
                .push_bind(&c.text)
                .push_bind(&c.author)
                .push_bind(c.published_at)
                .push_bind(key);
        });
        builder.push(" ON CONFLICT (comment_key) DO NOTHING");

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|err| map_db_error(Resource::Comment, &video_id, &video_id, err))?;
        Ok(result.rows_affected())
    }

    async fn counts_for_channel(&self, channel_id: &str) -> Result<ChannelCounts, HarvestError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM playlist_information WHERE channel_id = $1) AS playlists,
                (SELECT COUNT(*) FROM videoinformation WHERE channel_id = $1) AS videos,
                (SELECT COUNT(*)
                   FROM comment_information c
                   JOIN videoinformation v ON v.video_id = c.video_id
                  WHERE v.channel_id = $1) AS comments
            "#,
        )
        .bind(channel_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;

        let get = |col: &str| -> Result<u64, HarvestError> {
            let n: i64 = row.try_get(col).map_err(storage_error)?;
            Ok(n.max(0) as u64)
        };
        Ok(ChannelCounts {
            playlists: get("playlists")?,
            videos: get("videos")?,
            comments: get("comments")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredComment {
    pub comment_id: i64,
    pub comment_key: String,
    pub comment: Comment,
}

#[derive(Debug, Default)]
struct MemoryTables {
    channels: BTreeMap<String, Channel>,
    playlists: BTreeMap<String, Playlist>,
    videos: BTreeMap<String, Video>,
    comments: Vec<StoredComment>,
    comment_keys: HashSet<String>,
}

/// In-process store with the same key and parent rules as the Postgres schema.
#[derive(Debug, Default)]
pub struct MemoryHarvestStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryHarvestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn channels(&self) -> Vec<Channel> {
        self.tables.lock().await.channels.values().cloned().collect()
    }

    pub async fn playlists(&self) -> Vec<Playlist> {
        self.tables.lock().await.playlists.values().cloned().collect()
    }

    pub async fn videos(&self) -> Vec<Video> {
        self.tables.lock().await.videos.values().cloned().collect()
    }

    pub async fn comments(&self) -> Vec<StoredComment> {
        self.tables.lock().await.comments.clone()
    }
}

#[async_trait]
impl HarvestStore for MemoryHarvestStore {
    async fn channel_exists(&self, channel_id: &str) -> Result<bool, HarvestError> {
        Ok(self.tables.lock().await.channels.contains_key(channel_id))
    }

    async fn upsert_channel(&self, channel: &Channel) -> Result<bool, HarvestError> {
        let mut tables = self.tables.lock().await;
        if tables.channels.contains_key(&channel.id) {
            return Ok(false);
        }
        tables.channels.insert(channel.id.clone(), channel.clone());
        Ok(true)
    }

    async fn upsert_playlists(&self, playlists: &[Playlist]) -> Result<u64, HarvestError> {
        let mut tables = self.tables.lock().await;
        if let Some(orphan) = playlists
            .iter()
            .find(|p| !tables.channels.contains_key(&p.channel_id))
        {
            return Err(HarvestError::ForeignKeyViolation {
                entity: Resource::Playlist,
                id: orphan.id.clone(),
                parent_id: orphan.channel_id.clone(),
            });
        }

        let mut inserted = 0;
        for playlist in playlists {
            if !tables.playlists.contains_key(&playlist.id) {
                tables.playlists.insert(playlist.id.clone(), playlist.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn upsert_video(&self, video: &Video) -> Result<bool, HarvestError> {
        let mut tables = self.tables.lock().await;
        if !tables.channels.contains_key(&video.channel_id) {
            return Err(HarvestError::ForeignKeyViolation {
                entity: Resource::Video,
                id: video.id.clone(),
                parent_id: video.channel_id.clone(),
            });
        }
        if tables.videos.contains_key(&video.id) {
            return Ok(false);
        }
        tables.videos.insert(video.id.clone(), video.clone());
        Ok(true)
    }

    async fn insert_comments(&self, comments: &[Comment]) -> Result<u64, HarvestError> {
        let mut tables = self.tables.lock().await;
        if let Some(orphan) = comments
            .iter()
            .find(|c| !tables.videos.contains_key(&c.video_id))
        {
            return Err(HarvestError::ForeignKeyViolation {
                entity: Resource::Comment,
                id: orphan.video_id.clone(),
                parent_id: orphan.video_id.clone(),
            });
        }

        let mut inserted = 0;
        for comment in comments {
            let key = comment_key(comment);
            if !tables.comment_keys.insert(key.clone()) {
                continue;
            }
            let comment_id = tables.comments.len() as i64 + 1;
            tables.comments.push(StoredComment {
                comment_id,
                comment_key: key,
                comment: comment.clone(),
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn counts_for_channel(&self, channel_id: &str) -> Result<ChannelCounts, HarvestError> {
        let tables = self.tables.lock().await;
        let videos = tables
            .videos
            .values()
            .filter(|v| v.channel_id == channel_id)
            .map(|v| v.id.as_str())
            .collect::<HashSet<_>>();
        Ok(ChannelCounts {
            playlists: tables
                .playlists
                .values()
                .filter(|p| p.channel_id == channel_id)
                .count() as u64,
            videos: videos.len() as u64,
            comments: tables
                .comments
                .iter()
                .filter(|c| videos.contains(c.comment.video_id.as_str()))
                .count() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc)
    }

    fn channel(id: &str) -> Channel {
        Channel {
            id: id.to_string(),
            name: "Test Channel".into(),
            subscribers: 10,
            views: 100,
            video_count: 1,
            description: String::new(),
            uploads_playlist_id: Some("UU_test".into()),
        }
    }

    fn video(id: &str, channel_id: &str) -> Video {
        Video {
            id: id.to_string(),
            channel_id: channel_id.to_string(),
            channel_name: "Test Channel".into(),
            title: format!("video {id}"),
            tags: "rust,async".into(),
            thumbnail_url: String::new(),
            description: String::new(),
            published_at: ts("2022-05-01T10:00:00Z"),
            duration: "PT4M13S".into(),
            views: 0,
            likes: 0,
            comment_count: 0,
            favorite_count: 0,
            definition: "hd".into(),
            has_captions: false,
        }
    }

    fn comment(video_id: &str, text: &str) -> Comment {
        Comment {
            source_id: None,
            video_id: video_id.to_string(),
            text: text.to_string(),
            author: "viewer".into(),
            published_at: ts("2022-05-02T08:30:00Z"),
        }
    }

    #[test]
    fn comment_key_is_stable_and_content_sensitive() {
        let a = comment("v1", "first!");
        assert_eq!(comment_key(&a), comment_key(&a.clone()));
        assert_eq!(comment_key(&a).len(), 64);
        assert_ne!(comment_key(&a), comment_key(&comment("v1", "second")));
        assert_ne!(comment_key(&a), comment_key(&comment("v2", "first!")));
    }

    #[tokio::test]
    async fn duplicate_channel_write_is_a_no_op() {
        let store = MemoryHarvestStore::new();
        assert!(store.upsert_channel(&channel("UC_test")).await.expect("first"));
        assert!(!store.upsert_channel(&channel("UC_test")).await.expect("second"));
        assert_eq!(store.channels().await.len(), 1);
        assert!(store.channel_exists("UC_test").await.expect("exists"));
    }

    #[tokio::test]
    async fn children_require_committed_parents() {
        let store = MemoryHarvestStore::new();

        let err = store
            .upsert_video(&video("v1", "UC_missing"))
            .await
            .expect_err("orphan video");
        assert!(matches!(
            err,
            HarvestError::ForeignKeyViolation { entity: Resource::Video, .. }
        ));

        let err = store
            .insert_comments(&[comment("v1", "hi")])
            .await
            .expect_err("orphan comment");
        assert!(matches!(
            err,
            HarvestError::ForeignKeyViolation { entity: Resource::Comment, .. }
        ));
        assert!(store.comments().await.is_empty());
    }

    #[tokio::test]
    async fn playlist_page_is_rejected_as_a_whole_on_orphan() {
        let store = MemoryHarvestStore::new();
        store.upsert_channel(&channel("UC_test")).await.expect("channel");

        let good = Playlist {
            id: "PL1".into(),
            title: "Uploads".into(),
            channel_id: "UC_test".into(),
            channel_name: "Test Channel".into(),
            published_at: ts("2021-01-01T00:00:00Z"),
            item_count: 3,
        };
        let orphan = Playlist {
            id: "PL2".into(),
            channel_id: "UC_other".into(),
            ..good.clone()
        };

        assert!(store.upsert_playlists(&[good.clone(), orphan]).await.is_err());
        assert!(store.playlists().await.is_empty());

        assert_eq!(store.upsert_playlists(&[good.clone()]).await.expect("page"), 1);
        assert_eq!(store.upsert_playlists(&[good]).await.expect("again"), 0);
    }

    #[tokio::test]
    async fn repeated_comments_are_deduplicated_by_synthetic_key() {
        let store = MemoryHarvestStore::new();
        store.upsert_channel(&channel("UC_test")).await.expect("channel");
        store.upsert_video(&video("v1", "UC_test")).await.expect("video");

        let page = vec![comment("v1", "a"), comment("v1", "b")];
        assert_eq!(store.insert_comments(&page).await.expect("first"), 2);
        assert_eq!(store.insert_comments(&page).await.expect("replay"), 0);

        let stored = store.comments().await;
        assert_eq!(
            stored.iter().map(|c| c.comment_id).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let counts = store.counts_for_channel("UC_test").await.expect("counts");
        assert_eq!(
            counts,
            ChannelCounts {
                playlists: 0,
                videos: 1,
                comments: 2
            }
        );
    }

    #[test]
    fn comment_key_prefers_the_upstream_id() {
        let mut a = comment("v1", "same words");
        a.source_id = Some("Ugx1".into());
        let mut b = a.clone();
        b.source_id = Some("Ugx2".into());
        assert_ne!(comment_key(&a), comment_key(&b));

        let mut edited = a.clone();
        edited.text = "same words (edited)".into();
        assert_eq!(comment_key(&a), comment_key(&edited));

        assert_ne!(comment_key(&a), comment_key(&comment("v1", "same words")));
    }

    #[tokio::test]
    async fn identical_text_from_distinct_threads_is_kept() {
        let store = MemoryHarvestStore::new();
        store.upsert_channel(&channel("UC_test")).await.expect("channel");
        store.upsert_video(&video("v1", "UC_test")).await.expect("video");

        let mut first = comment("v1", "+1");
        first.source_id = Some("t1".into());
        let mut second = first.clone();
        second.source_id = Some("t2".into());

        let page = vec![first, second];
        assert_eq!(store.insert_comments(&page).await.expect("page"), 2);
        assert_eq!(store.insert_comments(&page).await.expect("replay"), 0);
        assert_eq!(store.comments().await.len(), 2);
    }
}
