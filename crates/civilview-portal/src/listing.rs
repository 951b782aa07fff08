use std::collections::HashSet;
use std::sync::Arc;

use civilview_core::{canonical_date, ListingStub, PropertyIdentifier};
use civilview_storage::{FetchError, PageSource};
use scraper::{ElementRef, Html};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{cell_text, element_text, normalize_label, resolve_url, selector, ParseError, PortalConfig};

/// Column order the portal has used historically; only consulted when the
/// results table arrives without a header row.
const DEFAULT_COLUMNS: &[&str] = &["", "sheriff #", "sales date", "plaintiff", "defendant", "address"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub page: u32,
    pub stubs: Vec<ListingStub>,
    pub skipped_rows: usize,
}

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("listing page {page} failed: {source}")]
    Page {
        page: u32,
        #[source]
        source: FetchError,
    },
    #[error("listing page {page} has {skipped_rows} rows and none could be read; the results layout has likely changed")]
    Layout { page: u32, skipped_rows: usize },
}

fn column_index(columns: &[String], names: &[&str]) -> Option<usize> {
    columns.iter().position(|c| names.contains(&c.as_str()))
}

fn cell_at(cells: &[ElementRef], idx: Option<usize>) -> Option<String> {
    idx.and_then(|i| cells.get(i)).and_then(|c| cell_text(*c))
}

/// Extracts listing stubs from one page of the sales index.
///
/// A missing results table is an error; a table with no data rows is an
/// empty page.
pub fn parse_listing_page(html: &str, base_url: &str, page: u32) -> Result<ListingPage, ParseError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table.table-striped")?;
    let row_sel = selector("tr")?;
    let th_sel = selector("th")?;
    let td_sel = selector("td")?;
    let link_sel = selector("a[href]")?;

    let table = document
        .select(&table_sel)
        .next()
        .ok_or(ParseError::MissingTable("results"))?;

    let mut columns: Vec<String> = DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect();
    let mut stubs = Vec::new();
    let mut skipped_rows = 0usize;

    for row in table.select(&row_sel) {
        let headings = row
            .select(&th_sel)
            .map(|h| normalize_label(&element_text(h)))
            .collect::<Vec<_>>();
        if !headings.is_empty() {
            columns = headings;
            continue;
        }

        let cells = row.select(&td_sel).collect::<Vec<_>>();
        if cells.is_empty() {
            continue;
        }
        // A lone cell without a link is a notice row such as "No sales found".
        if cells.len() == 1 && row.select(&link_sel).next().is_none() {
            continue;
        }

        let link = row
            .select(&link_sel)
            .find(|a| element_text(*a).trim().eq_ignore_ascii_case("details"))
            .or_else(|| row.select(&link_sel).next())
            .and_then(|a| a.value().attr("href"));
        let Some(href) = link else {
            warn!(page, "listing row without a details link; skipping");
            skipped_rows += 1;
            continue;
        };

        let sheriff = cell_at(&cells, column_index(&columns, &["sheriff #", "sheriff number"]));
        let Some(identifier) = sheriff.as_deref().and_then(PropertyIdentifier::parse) else {
            warn!(page, href, "listing row without a sheriff number; skipping");
            skipped_rows += 1;
            continue;
        };

        let property_id = href.rsplit('=').next().unwrap_or(href).trim().to_string();
        stubs.push(ListingStub {
            identifier,
            property_id,
            detail_url: resolve_url(base_url, href),
            sales_date: cell_at(&cells, column_index(&columns, &["sales date", "sale date"]))
                .as_deref()
                .and_then(canonical_date),
            address: cell_at(&cells, column_index(&columns, &["address"])),
            plaintiff: cell_at(&cells, column_index(&columns, &["plaintiff"])),
            defendant: cell_at(&cells, column_index(&columns, &["defendant"])),
            page,
        });
    }

    Ok(ListingPage {
        page,
        stubs,
        skipped_rows,
    })
}

/// Walks the portal's paginated sales index.
pub struct ListingFetcher {
    source: Arc<dyn PageSource>,
    config: PortalConfig,
}

impl ListingFetcher {
    pub fn new(source: Arc<dyn PageSource>, config: PortalConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    /// Starts a fresh walk from page 1. Pages are fetched only as the caller
    /// asks for them.
    pub fn fetch_current_listings(&self) -> ListingPages<'_> {
        ListingPages {
            fetcher: self,
            next_page: 1,
            seen: HashSet::new(),
            finished: false,
        }
    }

    fn page_url(&self, page: u32) -> String {
        let sep = if self.config.search_url.contains('?') { '&' } else { '?' };
        format!("{}{}page={}", self.config.search_url, sep, page)
    }

    fn matches_city(&self, stub: &ListingStub) -> bool {
        let Some(city) = self.config.city_filter.as_deref() else {
            return true;
        };
        stub.address
            .as_deref()
            .map(|a| a.to_uppercase().contains(&city.to_uppercase()))
            .unwrap_or(false)
    }

    async fn fetch_listing_page(&self, page: u32) -> Result<ListingPage, FetchError> {
        let url = self.page_url(page);
        let url = url.as_str();
        let source = &self.source;
        let base_url = self.config.base_url.as_str();

        self.config
            .render_backoff
            .retry(
                move |_| async move {
                    let fetched = source.fetch_page(url).await?;
                    parse_listing_page(&fetched.body, base_url, page).map_err(|err| {
                        FetchError::Render {
                            url: url.to_string(),
                            reason: err.to_string(),
                        }
                    })
                },
                |err| matches!(err, FetchError::Render { .. }),
            )
            .await
    }
}

/// Lazy cursor over the listing index, one portal page per `next_page` call.
pub struct ListingPages<'a> {
    fetcher: &'a ListingFetcher,
    next_page: u32,
    seen: HashSet<PropertyIdentifier>,
    finished: bool,
}

impl ListingPages<'_> {
    /// Returns the stubs of the next page, or `None` once the index is
    /// exhausted. A page whose rows all fail to parse is an error, not the end
    /// of the index. Stubs already yielded earlier in this walk and stubs outside
    /// the configured city are dropped, so a page may come back empty.
    pub async fn next_page(&mut self) -> Result<Option<Vec<ListingStub>>, ListingError> {
        if self.finished {
            return Ok(None);
        }

        let page = self.next_page;
        if page > self.fetcher.config.max_pages {
            warn!(max_pages = self.fetcher.config.max_pages, "listing page cap reached");
            self.finished = true;
            return Ok(None);
        }

        let parsed = match self.fetcher.fetch_listing_page(page).await {
            Ok(parsed) => parsed,
            Err(source) => {
                self.finished = true;
                return Err(ListingError::Page { page, source });
            }
        };

        if parsed.stubs.is_empty() && parsed.skipped_rows > 0 {
            self.finished = true;
            return Err(ListingError::Layout {
                page,
                skipped_rows: parsed.skipped_rows,
            });
        }
        if parsed.stubs.is_empty() {
            info!(page, "empty listing page; index complete");
            self.finished = true;
            return Ok(None);
        }
        if parsed.stubs.iter().all(|s| self.seen.contains(&s.identifier)) {
            info!(page, "listing page repeats earlier rows; index complete");
            self.finished = true;
            return Ok(None);
        }

        self.next_page += 1;
        let total = parsed.stubs.len();
        let fetcher = self.fetcher;
        let stubs = parsed
            .stubs
            .into_iter()
            .filter(|s| self.seen.insert(s.identifier.clone()))
            .filter(|s| fetcher.matches_city(s))
            .collect::<Vec<_>>();
        debug!(page, total, kept = stubs.len(), "listing page parsed");
        Ok(Some(stubs))
    }

    pub fn pages_fetched(&self) -> u32 {
        self.next_page - 1
    }
}
