//! Materializing a full snapshot before any write happens.

use std::sync::Arc;

use lobbysync_adapters::{AdapterContext, PageRef, RawRow, SnapshotSource};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPage {
    pub index: Option<usize>,
    pub url: Option<String>,
    pub error: String,
}

/// Rows of every page that downloaded, in page order.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub rows: Vec<RawRow>,
    pub pages_total: usize,
    pub failed_pages: Vec<FailedPage>,
}

/// Fetch the root listing, then every page concurrently. A root failure is
/// fatal; a page failure only drops that page's rows.
pub async fn fetch_snapshot(
    source: Arc<dyn SnapshotSource>,
    ctx: &AdapterContext,
) -> Result<Snapshot, SyncError> {
    let listing = source
        .fetch_root(ctx)
        .await
        .map_err(|err| SyncError::RootUnavailable {
            source_id: source.source_id().to_string(),
            source: err,
        })?;
    let pages_total = listing.pages.len();
    info!(source_id = source.source_id(), pages = pages_total, "fetched root listing");

    let mut tasks = JoinSet::new();
    for page in listing.pages {
        let source = source.clone();
        let ctx = ctx.clone();
        tasks.spawn(async move {
            let result = source.fetch_page(&ctx, &page).await;
            (page, result)
        });
    }

    let mut pages: Vec<(PageRef, Vec<RawRow>)> = Vec::with_capacity(pages_total);
    let mut failed_pages = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((page, Ok(rows))) => pages.push((page, rows)),
            Ok((page, Err(err))) => {
                warn!(page = page.index, url = %page.url, error = %err, "page fetch failed, its records are absent from this run");
                failed_pages.push(FailedPage {
                    index: Some(page.index),
                    url: Some(page.url),
                    error: err.to_string(),
                });
            }
            Err(err) => {
                warn!(error = %err, "page fetch task did not complete");
                failed_pages.push(FailedPage {
                    index: None,
                    url: None,
                    error: err.to_string(),
                });
            }
        }
    }

    pages.sort_by_key(|(page, _)| page.index);
    failed_pages.sort_by_key(|page| page.index);
    Ok(Snapshot {
        rows: pages.into_iter().flat_map(|(_, rows)| rows).collect(),
        pages_total,
        failed_pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lobbysync_adapters::{
        FixtureBundle, FixturePage, FixtureSource, RowKind, SnapshotKind,
    };

    fn page(n: usize, unavailable: bool) -> FixturePage {
        FixturePage {
            url: format!("fixture://register/{n}"),
            unavailable,
            rows: vec![RawRow::new(RowKind::Interest).with("page", n as u64)],
        }
    }

    #[tokio::test]
    async fn pages_are_reassembled_in_listing_order() {
        let source = FixtureSource::from_bundle(FixtureBundle {
            fixture_id: "ordering".into(),
            source_id: "register".into(),
            kind: SnapshotKind::Register,
            captured_from_url: "fixture://register".into(),
            fetched_at: Utc::now(),
            pages: (0..6).map(|n| page(n, n == 3)).collect(),
            notes: None,
        });

        let snapshot = fetch_snapshot(Arc::new(source), &AdapterContext::new())
            .await
            .expect("snapshot");
        let order = snapshot
            .rows
            .iter()
            .map(|row| row.fields["page"].as_u64().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(order, vec![0, 1, 2, 4, 5]);
        assert_eq!(snapshot.pages_total, 6);
        assert_eq!(snapshot.failed_pages.len(), 1);
        assert_eq!(snapshot.failed_pages[0].index, Some(3));
    }

    #[tokio::test]
    async fn root_failure_is_reported_as_unavailable() {
        let source = FixtureSource::from_path(
            "register",
            SnapshotKind::Register,
            "/nonexistent/lobbysync/bundle.json",
        );
        let err = fetch_snapshot(Arc::new(source), &AdapterContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RootUnavailable { .. }));
    }
}
