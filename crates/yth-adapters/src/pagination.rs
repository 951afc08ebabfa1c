//! Cursor-following driver for paginated listings.
//!
//! The streams are lazy: a page is only requested when the previous one has been
//! consumed, so callers can persist page by page. A stream restarts from the
//! first page only; there is no resuming from a failed cursor.

use std::future::Future;

use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use tracing::warn;
use yth_core::Page;

/// Yields each page's items as one batch, threading `next_cursor` into the next call.
///
/// The first call gets `None`. The stream ends after a page without a cursor,
/// after a page that hands back the cursor it was fetched with, and after the
/// first error.
pub fn pages<T, E, F, Fut>(fetch: F) -> impl Stream<Item = Result<Vec<T>, E>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>>,
{
    stream::try_unfold(
        (fetch, Some(None::<String>)),
        |(mut fetch, cursor)| async move {
            let Some(cursor) = cursor else {
                return Ok::<_, E>(None);
            };
            let page = fetch(cursor.clone()).await?;
            let next = match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    warn!(cursor = next.as_str(), "listing repeated its page cursor; stopping");
                    None
                }
                next => next.map(Some),
            };
            Ok::<_, E>(Some((page.items, (fetch, next))))
        },
    )
}

/// Flattened form of [`pages`]: one item at a time, in page-then-in-page order.
pub fn items<T, E, F, Fut>(fetch: F) -> impl Stream<Item = Result<T, E>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>>,
{
    pages(fetch)
        .map_ok(|batch| stream::iter(batch.into_iter().map(Ok::<T, E>)))
        .try_flatten()
}

/// Drains every page into one ordered `Vec`.
pub async fn drain<T, E, F, Fut>(fetch: F) -> Result<Vec<T>, E>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>>,
{
    let mut out = Vec::new();
    let mut batches = std::pin::pin!(pages(fetch));
    while let Some(batch) = batches.next().await {
        out.extend(batch?);
    }
    Ok(out)
}
