mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use civilview_portal::DetailFetcher;
use civilview_storage::CacheStore;
use common::{fixture, stub, FakeSource};
use tempfile::tempdir;

#[tokio::test]
async fn fresh_cache_hit_avoids_a_network_fetch() {
    let dir = tempdir().expect("tempdir");
    let target = stub("F-25000123", "1187402");
    let source = Arc::new(FakeSource::new().with_page(&target.detail_url, fixture("detail_page.html")));
    let fetcher = DetailFetcher::new(source.clone(), CacheStore::new(dir.path()));

    let live = fetcher.fetch_and_parse(&target).await.expect("live");
    assert!(!live.from_cache);
    assert_eq!(source.calls(&target.detail_url), 1);

    let cached = fetcher.fetch_and_parse(&target).await.expect("cached");
    assert!(cached.from_cache);
    assert_eq!(cached.record, live.record);
    assert_eq!(cached.portal_status, live.portal_status);
    assert_eq!(source.calls(&target.detail_url), 1);
}

#[tokio::test]
async fn expired_entry_is_refetched() {
    let dir = tempdir().expect("tempdir");
    let target = stub("F-25000123", "1187402");
    let cache = CacheStore::new(dir.path());
    cache
        .put_at(
            &target.identifier,
            &fixture("detail_page.html"),
            Utc::now() - Duration::hours(25),
        )
        .await
        .expect("seed");

    let source = Arc::new(FakeSource::new().with_page(&target.detail_url, fixture("detail_page.html")));
    let fetcher = DetailFetcher::new(source.clone(), cache.clone());

    let parsed = fetcher.fetch_and_parse(&target).await.expect("parse");
    assert!(!parsed.from_cache);
    assert_eq!(source.calls(&target.detail_url), 1);
    assert!(cache.get(&target.identifier).await.is_some());
}

#[tokio::test]
async fn cached_page_that_no_longer_parses_is_replaced() {
    let dir = tempdir().expect("tempdir");
    let target = stub("F-25000123", "1187402");
    let cache = CacheStore::new(dir.path());
    cache
        .put(&target.identifier, &fixture("detail_redesigned.html"))
        .await
        .expect("seed");

    let source = Arc::new(FakeSource::new().with_page(&target.detail_url, fixture("detail_page.html")));
    let fetcher = DetailFetcher::new(source.clone(), cache.clone());

    let parsed = fetcher.fetch_and_parse(&target).await.expect("parse");
    assert!(!parsed.from_cache);
    let entry = cache.get(&target.identifier).await.expect("recached");
    assert!(entry.content.contains("F-25000123</td>"));
}

#[tokio::test]
async fn structural_failures_are_reported_and_not_cached() {
    let dir = tempdir().expect("tempdir");
    let redesigned = stub("F-25000123", "1187402");
    let mismatched = stub("F-99999999", "1187403");
    let source = Arc::new(
        FakeSource::new()
            .with_page(&redesigned.detail_url, fixture("detail_redesigned.html"))
            .with_page(&mismatched.detail_url, fixture("detail_page.html")),
    );
    let cache = CacheStore::new(dir.path());
    let fetcher = DetailFetcher::new(source.clone(), cache.clone());

    let err = fetcher.fetch_and_parse(&redesigned).await.unwrap_err();
    assert!(err.is_structural());
    assert!(cache.get(&redesigned.identifier).await.is_none());

    let err = fetcher.fetch_and_parse(&mismatched).await.unwrap_err();
    assert!(err.is_structural());
    assert!(err.to_string().contains("F-99999999"));
}

#[tokio::test]
async fn fetch_failure_is_not_structural() {
    let dir = tempdir().expect("tempdir");
    let fetcher = DetailFetcher::new(Arc::new(FakeSource::new()), CacheStore::new(dir.path()));

    let err = fetcher
        .fetch_and_parse(&stub("F-1", "1"))
        .await
        .unwrap_err();
    assert!(!err.is_structural());
}
