//! Civil View portal adapter: walks the sales index and extracts detail pages.
//!
//! Every assumption about the portal's markup lives in this crate, so a site
//! redesign means changing the selectors here and nothing downstream.

mod detail;
mod listing;

use civilview_core::{normalize_text, PropertyIdentifier};
use civilview_storage::BackoffPolicy;
use scraper::{ElementRef, Selector};
use thiserror::Error;

pub use detail::{
    parse_detail_page, DetailError, DetailFetcher, ParsedDetail, ParsedProperty, RawFieldMap,
};
pub use listing::{parse_listing_page, ListingError, ListingFetcher, ListingPage, ListingPages};

pub const CRATE_NAME: &str = "civilview-portal";

pub const DEFAULT_BASE_URL: &str = "https://salesweb.civilview.com";
pub const DEFAULT_SEARCH_URL: &str = "https://salesweb.civilview.com/Sales/SalesSearch?countyId=10";

/// Structural mismatch between a page and the layout this crate expects.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid selector {0:?}")]
    Selector(String),
    #[error("{0} table not found")]
    MissingTable(&'static str),
    #[error("details table has no labelled rows")]
    NoLabelledRows,
    #[error("required field {0:?} missing")]
    MissingField(&'static str),
    #[error("page is for {found}, expected {expected}")]
    IdentifierMismatch {
        expected: PropertyIdentifier,
        found: PropertyIdentifier,
    },
}

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    pub search_url: String,
    /// Keep only listings whose address mentions this city.
    pub city_filter: Option<String>,
    pub max_pages: u32,
    /// Applied when a listing page loads but its results table is missing.
    pub render_backoff: BackoffPolicy,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            search_url: DEFAULT_SEARCH_URL.to_string(),
            city_filter: Some("JERSEY CITY".to_string()),
            max_pages: 50,
            render_backoff: BackoffPolicy::default(),
        }
    }
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector(format!("{css}: {e}")))
}

/// Text content of an element with text nodes joined by spaces, so `<br>`
/// separated lines do not run together.
fn element_text(element: ElementRef) -> String {
    element.text().collect::<Vec<_>>().join(" ")
}

fn cell_text(element: ElementRef) -> Option<String> {
    normalize_text(&element_text(element))
}

/// Lower-cased label with surrounding whitespace and trailing `:`/`*` removed.
fn normalize_label(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(|c: char| c == ':' || c == '*' || c.is_whitespace())
        .to_lowercase()
}

fn resolve_url(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{}{}", base_url.trim_end_matches('/'), href)
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), href)
    }
}
