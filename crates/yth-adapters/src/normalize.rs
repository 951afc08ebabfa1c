//! Raw payload -> canonical record mapping.
//!
//! Absent counters become 0 and absent text becomes "". Missing ids, bad
//! timestamps and non-numeric counters fail the single record with
//! `MalformedResponse`; whether that aborts the run is the caller's call.

use chrono::{DateTime, Utc};
use yth_core::{Channel, Comment, HarvestError, Playlist, Resource, Video};

use crate::payload::{ChannelPayload, CommentThreadPayload, PlaylistPayload, VideoPayload};

pub const DEFAULT_DEFINITION: &str = "sd";
pub const TAG_DELIMITER: &str = ",";

pub fn channel(payload: &ChannelPayload) -> Result<Channel, HarvestError> {
    let id = required_id(Resource::Channel, payload.id.as_deref())?;
    let stats = &payload.statistics;

    Ok(Channel {
        name: text(&payload.snippet.title),
        subscribers: count(Resource::Channel, &id, "subscriberCount", &stats.subscriber_count)?,
        views: count(Resource::Channel, &id, "viewCount", &stats.view_count)?,
        video_count: count(Resource::Channel, &id, "videoCount", &stats.video_count)?,
        description: text(&payload.snippet.description),
        uploads_playlist_id: payload
            .content_details
            .related_playlists
            .uploads
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string),
        id,
    })
}

pub fn playlist(payload: &PlaylistPayload, owner: &Channel) -> Result<Playlist, HarvestError> {
    let id = required_id(Resource::Playlist, payload.id.as_deref())?;
    let published_at = timestamp(
        Resource::Playlist,
        &id,
        "publishedAt",
        payload.snippet.published_at.as_deref(),
    )?;
    let item_count = payload.content_details.item_count.unwrap_or(0);

    Ok(Playlist {
        title: text(&payload.snippet.title),
        channel_id: owner.id.clone(),
        channel_name: owner.name.clone(),
        published_at,
        item_count: i64::try_from(item_count).map_err(|_| {
            HarvestError::malformed(Resource::Playlist, &id, "itemCount out of range")
        })?,
        id,
    })
}

pub fn video(payload: &VideoPayload, owner: &Channel) -> Result<Video, HarvestError> {
    let id = required_id(Resource::Video, payload.id.as_deref())?;
    let snippet = &payload.snippet;
    let details = &payload.content_details;
    let stats = &payload.statistics;

    Ok(Video {
        channel_id: owner.id.clone(),
        channel_name: owner.name.clone(),
        title: text(&snippet.title),
        tags: snippet
            .tags
            .as_deref()
            .unwrap_or_default()
            .join(TAG_DELIMITER),
        thumbnail_url: snippet
            .thumbnails
            .default
            .as_ref()
            .and_then(|t| t.url.clone())
            .unwrap_or_default(),
        description: text(&snippet.description),
        published_at: timestamp(
            Resource::Video,
            &id,
            "publishedAt",
            snippet.published_at.as_deref(),
        )?,
        duration: text(&details.duration),
        views: count(Resource::Video, &id, "viewCount", &stats.view_count)?,
        likes: count(Resource::Video, &id, "likeCount", &stats.like_count)?,
        comment_count: count(Resource::Video, &id, "commentCount", &stats.comment_count)?,
        favorite_count: count(Resource::Video, &id, "favoriteCount", &stats.favorite_count)?,
        definition: details
            .definition
            .as_deref()
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_DEFINITION.to_string()),
        has_captions: details
            .caption
            .as_deref()
            .is_some_and(|c| c.trim().eq_ignore_ascii_case("true")),
        id,
    })
}

/// Maps the top-level comment of a thread. Replies are not part of the schema.
pub fn comment(payload: &CommentThreadPayload, video_id: &str) -> Result<Comment, HarvestError> {
    let thread_id = payload.id.as_deref().unwrap_or(video_id);
    let Some(top) = payload.snippet.top_level_comment.as_ref() else {
        return Err(HarvestError::malformed(
            Resource::Comment,
            thread_id,
            "thread has no topLevelComment",
        ));
    };

    let source_id = top
        .id
        .as_deref()
        .or(payload.id.as_deref())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToString::to_string);

    Ok(Comment {
        source_id,
        video_id: video_id.to_string(),
        text: text(&top.snippet.text_display),
        author: text(&top.snippet.author_display_name),
        published_at: timestamp(
            Resource::Comment,
            thread_id,
            "publishedAt",
            top.snippet.published_at.as_deref(),
        )?,
    })
}

fn required_id(resource: Resource, id: Option<&str>) -> Result<String, HarvestError> {
    match id.map(str::trim) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(HarvestError::malformed(resource, "<missing>", "resource has no id")),
    }
}

fn text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn count(
    resource: Resource,
    id: &str,
    field: &str,
    value: &Option<String>,
) -> Result<i64, HarvestError> {
    let Some(raw) = value.as_deref() else {
        return Ok(0);
    };
    raw.trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| i64::try_from(n).ok())
        .ok_or_else(|| {
            HarvestError::malformed(
                resource,
                id,
                format!("{field} is not a non-negative integer: {raw:?}"),
            )
        })
}

pub fn timestamp(
    resource: Resource,
    id: &str,
    field: &str,
    value: Option<&str>,
) -> Result<DateTime<Utc>, HarvestError> {
    let Some(raw) = value else {
        return Err(HarvestError::malformed(resource, id, format!("{field} is missing")));
    };
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            HarvestError::malformed(resource, id, format!("{field} {raw:?} is not RFC 3339: {err}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner() -> Channel {
        Channel {
            id: "UC_test".into(),
            name: "Test Channel".into(),
            subscribers: 0,
            views: 0,
            video_count: 0,
            description: String::new(),
            uploads_playlist_id: None,
        }
    }

    #[test]
    fn channel_without_description_normalizes_to_empty_string() {
        let payload: ChannelPayload = serde_json::from_value(json!({
            "id": "UC_test",
            "snippet": { "title": "Test Channel" },
            "statistics": { "viewCount": "1200", "videoCount": "3" },
            "contentDetails": { "relatedPlaylists": { "uploads": "UU_test" } }
        }))
        .expect("payload");

        let channel = channel(&payload).expect("normalized");
        assert_eq!(channel.description, "");
        assert_eq!(channel.subscribers, 0);
        assert_eq!(channel.views, 1200);
        assert_eq!(channel.video_count, 3);
        assert_eq!(channel.uploads_playlist_id.as_deref(), Some("UU_test"));
    }

    #[test]
    fn blank_uploads_playlist_means_no_uploads() {
        let payload: ChannelPayload = serde_json::from_value(json!({
            "id": "UC_test",
            "contentDetails": { "relatedPlaylists": { "uploads": "" } }
        }))
        .expect("payload");
        assert_eq!(channel(&payload).expect("normalized").uploads_playlist_id, None);
    }

    #[test]
    fn non_numeric_counter_is_malformed() {
        let payload: ChannelPayload = serde_json::from_value(json!({
            "id": "UC_test",
            "statistics": { "subscriberCount": "-5" }
        }))
        .expect("payload");
        let err = channel(&payload).expect_err("negative counter");
        assert!(matches!(
            err,
            HarvestError::MalformedResponse { resource: Resource::Channel, .. }
        ));
    }

    #[test]
    fn sparse_video_gets_defaults_and_keeps_duration_verbatim() {
        let payload: VideoPayload = serde_json::from_value(json!({
            "id": "v1",
            "snippet": {
                "title": "Intro",
                "publishedAt": "2022-03-04T05:06:07Z",
                "thumbnails": { "default": { "url": "https://i.ytimg.com/vi/v1/default.jpg" } }
            },
            "contentDetails": { "duration": "PT1H2M3S", "caption": "true" },
            "statistics": { "viewCount": "42" }
        }))
        .expect("payload");

        let video = video(&payload, &owner()).expect("normalized");
        assert_eq!(video.channel_id, "UC_test");
        assert_eq!(video.channel_name, "Test Channel");
        assert_eq!(video.tags, "");
        assert_eq!(video.description, "");
        assert_eq!(video.duration, "PT1H2M3S");
        assert_eq!(video.views, 42);
        assert_eq!(video.likes, 0);
        assert_eq!(video.favorite_count, 0);
        assert_eq!(video.definition, "sd");
        assert!(video.has_captions);
        assert_eq!(video.thumbnail_url, "https://i.ytimg.com/vi/v1/default.jpg");
    }

    #[test]
    fn video_tags_are_flattened_with_commas() {
        let payload: VideoPayload = serde_json::from_value(json!({
            "id": "v2",
            "snippet": { "tags": ["rust", "tokio", "sqlx"], "publishedAt": "2022-03-04T05:06:07Z" },
            "contentDetails": { "definition": "HD", "caption": "false" }
        }))
        .expect("payload");

        let video = video(&payload, &owner()).expect("normalized");
        assert_eq!(video.tags, "rust,tokio,sqlx");
        assert_eq!(video.definition, "hd");
        assert!(!video.has_captions);
    }

    #[test]
    fn malformed_timestamp_fails_only_that_record() {
        let payload: VideoPayload = serde_json::from_value(json!({
            "id": "v3",
            "snippet": { "publishedAt": "04/03/2022" }
        }))
        .expect("payload");

        let err = video(&payload, &owner()).expect_err("bad timestamp");
        match err {
            HarvestError::MalformedResponse { resource, id, reason } => {
                assert_eq!(resource, Resource::Video);
                assert_eq!(id, "v3");
                assert!(reason.contains("publishedAt"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn playlist_reads_item_count_from_content_details() {
        let payload: PlaylistPayload = serde_json::from_value(json!({
            "id": "PL1",
            "snippet": { "title": "Talks", "publishedAt": "2020-01-01T00:00:00.000Z" },
            "contentDetails": { "itemCount": 12 }
        }))
        .expect("payload");

        let playlist = playlist(&payload, &owner()).expect("normalized");
        assert_eq!(playlist.item_count, 12);
        assert_eq!(playlist.channel_id, "UC_test");
        assert_eq!(playlist.channel_name, "Test Channel");
    }

    #[test]
    fn comment_uses_top_level_snippet() {
        let payload: CommentThreadPayload = serde_json::from_value(json!({
            "id": "thread-1",
            "snippet": {
                "topLevelComment": {
                    "id": "c1",
                    "snippet": {
                        "textDisplay": "great video",
                        "authorDisplayName": "@viewer",
                        "publishedAt": "2023-07-08T09:10:11Z"
                    }
                }
            }
        }))
        .expect("payload");

        let comment = comment(&payload, "v1").expect("normalized");
        assert_eq!(comment.source_id.as_deref(), Some("c1"));
        assert_eq!(comment.video_id, "v1");
        assert_eq!(comment.text, "great video");
        assert_eq!(comment.author, "@viewer");

        let empty = CommentThreadPayload::default();
        assert!(super::comment(&empty, "v1").is_err());
    }
}
