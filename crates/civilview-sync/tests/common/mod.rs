#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use civilview_storage::{BackoffPolicy, FetchError, FetchedPage, PageSource};
use civilview_sync::SyncConfig;

pub const BASE_URL: &str = "https://portal.test";
pub const SEARCH_URL: &str = "https://portal.test/Sales/SalesSearch?countyId=10";

pub fn listing_url(page: u32) -> String {
    format!("{SEARCH_URL}&page={page}")
}

pub fn detail_url(property_id: u32) -> String {
    format!("{BASE_URL}/Sales/SaleDetails?PropertyId={property_id}")
}

pub fn sheriff(n: u32) -> String {
    format!("F-{:08}", n)
}

pub fn config(workdir: &Path) -> SyncConfig {
    SyncConfig {
        search_url: SEARCH_URL.to_string(),
        base_url: BASE_URL.to_string(),
        cache_dir: workdir.join("cache"),
        reports_dir: workdir.join("reports"),
        log_file: workdir.join("sync.log"),
        ..SyncConfig::from_lookup(|_| None)
    }
}

pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 1,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
    }
}

/// Listing page with one row per property number.
pub fn listing_html(properties: &[u32]) -> String {
    let rows = properties
        .iter()
        .map(|n| {
            format!(
                r#"<tr><td><a href="/Sales/SaleDetails?PropertyId={n}">Details</a></td>
                   <td>{}</td><td>10/23/2025</td><td>BANK {n}</td><td>OWNER {n}</td>
                   <td>{n} MAIN STREET JERSEY CITY NJ 07302</td></tr>"#,
                sheriff(*n)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"<html><body><table class="table table-striped">
        <thead><tr><th></th><th>Sheriff #</th><th>Sales Date</th><th>Plaintiff</th><th>Defendant</th><th>Address</th></tr></thead>
        <tbody>{rows}</tbody></table></body></html>"#
    )
}

pub fn detail_html(n: u32, sales_date: &str) -> String {
    format!(
        r#"<html><body><table class="table table-striped">
        <tr><td class="heading-bold columnwidth-15">Sheriff # :</td><td>{}</td></tr>
        <tr><td class="heading-bold columnwidth-15">Court Case #:</td><td>F-{n}-24</td></tr>
        <tr><td class="heading-bold columnwidth-15">Sales Date :</td><td>{sales_date}</td></tr>
        <tr><td class="heading-bold columnwidth-15">Plaintiff :</td><td>BANK {n}</td></tr>
        <tr><td class="heading-bold columnwidth-15">Defendant :</td><td>OWNER {n}</td></tr>
        <tr><td class="heading-bold columnwidth-15">Address :</td><td>{n} MAIN STREET<br/>JERSEY CITY NJ 07302</td></tr>
        <tr><td class="heading-bold columnwidth-15">Approx. Judgment* :</td><td>$100,{n:03}.00</td></tr>
        <tr><td class="heading-bold columnwidth-15">Good Faith Upset* :</td><td>N/A</td></tr>
        </table>
        <table class="table table-striped" id="longTable">
        <tr><th>Status</th><th>Date</th></tr>
        <tr><td>Scheduled</td><td>8/14/2025</td></tr>
        </table></body></html>"#,
        sheriff(n)
    )
}

pub fn redesigned_html() -> String {
    "<html><body><main><section class=\"property-card\"><h2>?</h2></section></main></body></html>"
        .to_string()
}

/// In-memory portal. Unknown URLs are 404s.
#[derive(Default)]
pub struct FakePortal {
    pages: Mutex<HashMap<String, String>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakePortal {
    /// Page 1 lists `properties`, page 2 is empty, and every detail page parses.
    pub fn with_listing(properties: &[u32]) -> Self {
        let portal = Self::default();
        portal.set_page(listing_url(1), listing_html(properties));
        portal.set_page(listing_url(2), listing_html(&[]));
        for n in properties {
            portal.set_page(detail_url(*n), detail_html(*n, "10/23/2025"));
        }
        portal
    }

    pub fn set_page(&self, url: String, body: String) {
        self.pages.lock().unwrap().insert(url, body);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PageSource for FakePortal {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let body = self.pages.lock().unwrap().get(url).cloned();
        match body {
            Some(body) => Ok(FetchedPage {
                url: url.to_string(),
                final_url: url.to_string(),
                body,
                fetched_at: Utc::now(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}
