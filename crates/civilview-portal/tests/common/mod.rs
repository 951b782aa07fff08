#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use civilview_core::{ListingStub, PropertyIdentifier};
use civilview_portal::PortalConfig;
use civilview_storage::{BackoffPolicy, FetchError, FetchedPage, PageSource};

pub const BASE_URL: &str = "https://portal.test";
pub const SEARCH_URL: &str = "https://portal.test/Sales/SalesSearch?countyId=10";

pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

pub fn fixture(name: &str) -> String {
    let path = workspace_root().join("fixtures/civilview").join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
}

pub fn listing_url(page: u32) -> String {
    format!("{SEARCH_URL}&page={page}")
}

pub fn portal_config() -> PortalConfig {
    PortalConfig {
        base_url: BASE_URL.to_string(),
        search_url: SEARCH_URL.to_string(),
        render_backoff: BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
        ..PortalConfig::default()
    }
}

pub fn stub(identifier: &str, property_id: &str) -> ListingStub {
    ListingStub {
        identifier: PropertyIdentifier::parse(identifier).expect("identifier"),
        property_id: property_id.to_string(),
        detail_url: format!("{BASE_URL}/Sales/SaleDetails?PropertyId={property_id}"),
        sales_date: None,
        address: None,
        plaintiff: None,
        defendant: None,
        page: 1,
    }
}

/// Serves canned bodies per URL. A URL with several bodies returns them in
/// order and then keeps returning the last one; unknown URLs are 404s.
#[derive(Default)]
pub struct FakeSource {
    pages: Mutex<HashMap<String, Vec<String>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.pages
            .lock()
            .unwrap()
            .entry(url.into())
            .or_default()
            .push(body.into());
        self
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl PageSource for FakeSource {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(url.to_string()).or_default();
            *n += 1;
            *n
        };
        let pages = self.pages.lock().unwrap();
        let Some(bodies) = pages.get(url) else {
            return Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            });
        };
        let body = bodies[(call - 1).min(bodies.len() - 1)].clone();
        Ok(FetchedPage {
            url: url.to_string(),
            final_url: url.to_string(),
            body,
            fetched_at: Utc::now(),
        })
    }
}

pub fn empty_results_page() -> String {
    r#"<html><body><table class="table table-striped">
        <thead><tr><th></th><th>Sheriff #</th><th>Sales Date</th><th>Plaintiff</th><th>Defendant</th><th>Address</th></tr></thead>
        <tbody></tbody>
    </table></body></html>"#
        .to_string()
}
