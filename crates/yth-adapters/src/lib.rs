//! Content API contract, HTTP client, payload normalization and pagination.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use yth_core::{HarvestError, Page, Resource};
use yth_storage::{FetchError, HttpFetcher};

pub mod normalize;
pub mod pagination;
pub mod payload;

use payload::{
    ChannelPayload, CommentThreadPayload, ListResponse, PlaylistItemPayload, PlaylistPayload,
    VideoPayload,
};

pub const CRATE_NAME: &str = "yth-adapters";

pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// Upstream maximum for `playlists` and `playlistItems` pages.
pub const PLAYLIST_PAGE_SIZE: u32 = 50;
/// Upstream maximum for `commentThreads` pages.
pub const COMMENT_PAGE_SIZE: u32 = 100;

/// The five read operations a harvest needs from the content API.
///
/// Implementations own retries; every error they return is final for that call.
#[async_trait]
pub trait ContentApi: Send + Sync {
    async fn fetch_channel(&self, channel_id: &str) -> Result<ChannelPayload, HarvestError>;

    async fn fetch_playlists_for_channel(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<PlaylistPayload>, HarvestError>;

    /// Video ids of one page of a playlist, in playlist order.
    async fn fetch_playlist_items(
        &self,
        playlist_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<String>, HarvestError>;

    async fn fetch_video_detail(&self, video_id: &str) -> Result<VideoPayload, HarvestError>;

    async fn fetch_comment_threads(
        &self,
        video_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<CommentThreadPayload>, HarvestError>;
}

/// `ContentApi` over the YouTube Data API v3 REST endpoints.
#[derive(Debug, Clone)]
pub struct DataApiClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    api_key: String,
}

impl DataApiClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    async fn list<T: DeserializeOwned>(
        &self,
        resource: Resource,
        id: &str,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<ListResponse<T>, HarvestError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut query = params.to_vec();
        query.push(("key", self.api_key.as_str()));

        let resp = self
            .http
            .get(&url, &query)
            .await
            .map_err(|err| map_fetch_error(resource, id, err))?;
        debug!(endpoint, id, attempts = resp.attempts, bytes = resp.body.len(), "fetched page");

        serde_json::from_slice(&resp.body)
            .map_err(|err| HarvestError::malformed(resource, id, format!("undecodable body: {err}")))
    }
}

fn map_fetch_error(resource: Resource, id: &str, err: FetchError) -> HarvestError {
    if err.status() == Some(404) {
        return HarvestError::not_found(resource, id);
    }
    HarvestError::UpstreamUnavailable {
        resource,
        id: id.to_string(),
        attempts: err.attempts(),
        reason: err.to_string(),
    }
}

fn with_cursor<'a>(params: &mut Vec<(&'a str, &'a str)>, cursor: Option<&'a str>) {
    if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
        params.push(("pageToken", cursor));
    }
}

#[async_trait]
impl ContentApi for DataApiClient {
    async fn fetch_channel(&self, channel_id: &str) -> Result<ChannelPayload, HarvestError> {
        let resp: ListResponse<ChannelPayload> = self
            .list(
                Resource::Channel,
                channel_id,
                "channels",
                &[("part", "snippet,statistics,contentDetails"), ("id", channel_id)],
            )
            .await?;
        resp.items
            .into_iter()
            .next()
            .ok_or_else(|| HarvestError::not_found(Resource::Channel, channel_id))
    }

    async fn fetch_playlists_for_channel(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<PlaylistPayload>, HarvestError> {
        let max_results = PLAYLIST_PAGE_SIZE.to_string();
        let mut params = vec![
            ("part", "snippet,contentDetails"),
            ("channelId", channel_id),
            ("maxResults", max_results.as_str()),
        ];
        with_cursor(&mut params, cursor);

        let resp: ListResponse<PlaylistPayload> = self
            .list(Resource::Playlist, channel_id, "playlists", &params)
            .await?;
        Ok(Page {
            items: resp.items,
            next_cursor: resp.next_page_token,
        })
    }

    async fn fetch_playlist_items(
        &self,
        playlist_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<String>, HarvestError> {
        let max_results = PLAYLIST_PAGE_SIZE.to_string();
        let mut params = vec![
            ("part", "snippet"),
            ("playlistId", playlist_id),
            ("maxResults", max_results.as_str()),
        ];
        with_cursor(&mut params, cursor);

        let resp: ListResponse<PlaylistItemPayload> = self
            .list(Resource::PlaylistItems, playlist_id, "playlistItems", &params)
            .await?;

        let mut video_ids = Vec::with_capacity(resp.items.len());
        for item in resp.items {
            match item.snippet.resource_id.video_id.filter(|id| !id.is_empty()) {
                Some(video_id) => video_ids.push(video_id),
                None => warn!(playlist_id, "playlist item without a video id; ignoring"),
            }
        }
        Ok(Page {
            items: video_ids,
            next_cursor: resp.next_page_token,
        })
    }

    async fn fetch_video_detail(&self, video_id: &str) -> Result<VideoPayload, HarvestError> {
        let resp: ListResponse<VideoPayload> = self
            .list(
                Resource::Video,
                video_id,
                "videos",
                &[("part", "snippet,contentDetails,statistics"), ("id", video_id)],
            )
            .await?;
        resp.items
            .into_iter()
            .next()
            .ok_or_else(|| HarvestError::not_found(Resource::Video, video_id))
    }

    async fn fetch_comment_threads(
        &self,
        video_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<CommentThreadPayload>, HarvestError> {
        let max_results = COMMENT_PAGE_SIZE.to_string();
        let mut params = vec![
            ("part", "snippet"),
            ("videoId", video_id),
            ("maxResults", max_results.as_str()),
        ];
        with_cursor(&mut params, cursor);

        let resp: ListResponse<CommentThreadPayload> = self
            .list(Resource::CommentThreads, video_id, "commentThreads", &params)
            .await?;
        Ok(Page {
            items: resp.items,
            next_cursor: resp.next_page_token,
        })
    }
}
