//! Calendar listing parser + detail-page enricher.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use permits_core::{DateWindow, Permit, PermitStatus};
use permits_storage::{FetchError, PageClient};
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "permits-scrape";

const LISTING_SELECTOR: &str = "#eventlist a";
const LISTING_DELIMITER: &str = " - ";
const LISTING_FIELD_COUNT: usize = 4;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("listing entry {raw:?} split into {found} fields, expected {expected}")]
    ListingEntry {
        raw: String,
        expected: usize,
        found: usize,
    },
    #[error("listing entry {raw:?} has no href")]
    MissingHref { raw: String },
    #[error("invalid selector {selector:?}")]
    Selector { selector: String },
    #[error("detail field {field} not found at {locator}")]
    DetailField { field: &'static str, locator: String },
    #[error("participants value {raw:?} is not a number")]
    Participants { raw: String },
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Failure enriching a single permit. Never fatal to the batch; the run
/// summary carries these and the record stays skeletal.
#[derive(Debug, Error)]
#[error("enriching permit {number} from {url}: {source}")]
pub struct EnrichError {
    pub number: String,
    pub url: String,
    #[source]
    pub source: ScrapeError,
}

/// Page retrieval capability used by the scrapers. Production code hands in
/// the shared [`PageClient`]; tests substitute canned pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn page_html(&self, run_id: Uuid, url: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl PageSource for PageClient {
    async fn page_html(&self, run_id: Uuid, url: &str) -> Result<String, FetchError> {
        self.fetch_page(run_id, url).await
    }
}

#[derive(Debug, Clone)]
pub struct CalendarConfig {
    /// Origin relative listing hrefs resolve against.
    pub origin: String,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            origin: "https://capitolpermits.chp.ca.gov".to_string(),
        }
    }
}

impl CalendarConfig {
    pub fn listing_url(&self, window: &DateWindow) -> String {
        let mut url = format!(
            "{}/Event/GetCalendarEvents/?dateBegin={}",
            self.origin,
            window.begin.format("%Y-%m-%d")
        );
        if let Some(end) = window.end {
            url.push_str(&format!("&dateEnd={}", end.format("%Y-%m-%d")));
        }
        url
    }
}

/// Fetches the calendar page for a date window and parses skeletal permits.
pub struct CalendarScraper<'a, S: PageSource> {
    source: &'a S,
    config: CalendarConfig,
}

impl<'a, S: PageSource> CalendarScraper<'a, S> {
    pub fn new(source: &'a S, config: CalendarConfig) -> Self {
        Self { source, config }
    }

    pub async fn fetch_listing(
        &self,
        run_id: Uuid,
        window: &DateWindow,
    ) -> Result<Vec<Permit>, ScrapeError> {
        let url = self.config.listing_url(window);
        let html = self.source.page_html(run_id, &url).await?;
        Ok(parse_listing(&html, &self.config.origin)?)
    }
}

/// Parse the calendar page into skeletal permits.
///
/// Each entry anchor carries a relative detail href, an inline style whose
/// green marker means approved, and a dash-delimited payload of exactly
/// four fields: number, start date/time, sponsor, location.
pub fn parse_listing(html: &str, origin: &str) -> Result<Vec<Permit>, ParseError> {
    let document = Html::parse_document(html);
    let selector = parse_selector(LISTING_SELECTOR)?;

    let mut permits = Vec::new();
    for anchor in document.select(&selector) {
        let raw = anchor.text().collect::<String>().trim().to_string();

        let href = anchor
            .value()
            .attr("href")
            .ok_or_else(|| ParseError::MissingHref { raw: raw.clone() })?;
        let status = PermitStatus::from_style_attr(anchor.value().attr("style"));

        let parts: Vec<&str> = raw.split(LISTING_DELIMITER).collect();
        if parts.len() != LISTING_FIELD_COUNT {
            return Err(ParseError::ListingEntry {
                raw: raw.clone(),
                expected: LISTING_FIELD_COUNT,
                found: parts.len(),
            });
        }

        permits.push(Permit {
            status,
            number: parts[0].trim().to_string(),
            url: format!("{origin}{href}"),
            start_date_time: parts[1].trim().to_string(),
            event_sponsor: parts[2].trim().to_string(),
            location_on_capitol_grounds: parts[3].trim().to_string(),
            set_up_date_time: None,
            end_date_time: None,
            participants: None,
            details: None,
        });
    }
    Ok(permits)
}

/// Position of a named field on the detail page.
#[derive(Debug, Clone)]
pub struct Locator {
    pub selector: String,
    pub index: usize,
}

impl Locator {
    fn display_field(index: usize) -> Self {
        Self {
            selector: ".display-field".to_string(),
            index,
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.selector, self.index)
    }
}

/// Named extraction mapping for the detail page.
///
/// The page renders permit fields as a repeated `.display-field` structure.
/// Each entry here names the node a field is read from, so layout drift
/// fails at this boundary with the field named instead of silently
/// mis-assigning values.
#[derive(Debug, Clone)]
pub struct DetailFieldMap {
    pub set_up_date_time: Locator,
    pub end_date_time: Locator,
    pub participants: Locator,
    pub details: Locator,
}

impl Default for DetailFieldMap {
    fn default() -> Self {
        Self {
            set_up_date_time: Locator::display_field(3),
            end_date_time: Locator::display_field(5),
            participants: Locator::display_field(6),
            details: Locator::display_field(7),
        }
    }
}

/// Fields extracted from one permit detail page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailFields {
    pub set_up_date_time: String,
    pub end_date_time: String,
    pub participants: u32,
    pub details: String,
}

pub fn parse_detail(html: &str, map: &DetailFieldMap) -> Result<DetailFields, ParseError> {
    let document = Html::parse_document(html);
    let set_up_date_time = locate_text(&document, "set_up_date_time", &map.set_up_date_time)?;
    let end_date_time = locate_text(&document, "end_date_time", &map.end_date_time)?;
    let participants_raw = locate_text(&document, "participants", &map.participants)?;
    let details = locate_text(&document, "details", &map.details)?;

    Ok(DetailFields {
        set_up_date_time,
        end_date_time,
        participants: parse_participants(&participants_raw)?,
        details,
    })
}

fn locate_text(
    document: &Html,
    field: &'static str,
    locator: &Locator,
) -> Result<String, ParseError> {
    let selector = parse_selector(&locator.selector)?;
    document
        .select(&selector)
        .nth(locator.index)
        .map(|node| node.text().collect::<String>().trim().to_string())
        .ok_or_else(|| ParseError::DetailField {
            field,
            locator: locator.to_string(),
        })
}

/// Participant counts render with thousands separators ("1,234").
pub fn parse_participants(raw: &str) -> Result<u32, ParseError> {
    raw.replace(',', "")
        .parse()
        .map_err(|_| ParseError::Participants {
            raw: raw.to_string(),
        })
}

fn parse_selector(selector: &str) -> Result<Selector, ParseError> {
    Selector::parse(selector).map_err(|_| ParseError::Selector {
        selector: selector.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct EnricherConfig {
    /// Simultaneous detail fetches. A hard cap, not a hint.
    pub concurrency: usize,
    pub fields: DetailFieldMap,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            fields: DetailFieldMap::default(),
        }
    }
}

#[derive(Debug)]
pub struct EnrichOutcome {
    pub permits: Vec<Permit>,
    pub failures: Vec<EnrichError>,
}

/// Fills detail fields for a batch of skeletal permits under a bounded
/// fan-out.
pub struct DetailEnricher<'a, S: PageSource> {
    source: &'a S,
    config: EnricherConfig,
}

impl<'a, S: PageSource> DetailEnricher<'a, S> {
    pub fn new(source: &'a S, config: EnricherConfig) -> Self {
        Self { source, config }
    }

    /// Enrich every permit in the batch and return only once all scheduled
    /// fetches have settled. A failed record is logged, reported in
    /// `failures`, and kept skeletal; the batch never aborts.
    pub async fn enrich(&self, run_id: Uuid, permits: Vec<Permit>) -> EnrichOutcome {
        let settled: Vec<(Permit, Option<EnrichError>)> =
            stream::iter(permits.into_iter().map(|permit| self.enrich_one(run_id, permit)))
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;

        let mut permits = Vec::with_capacity(settled.len());
        let mut failures = Vec::new();
        for (permit, failure) in settled {
            if let Some(failure) = failure {
                warn!(
                    number = %permit.number,
                    error = %failure,
                    "detail enrichment failed; keeping skeletal record"
                );
                failures.push(failure);
            }
            permits.push(permit);
        }

        EnrichOutcome { permits, failures }
    }

    async fn enrich_one(&self, run_id: Uuid, mut permit: Permit) -> (Permit, Option<EnrichError>) {
        match self.fetch_detail(run_id, &permit.url).await {
            Ok(fields) => {
                permit.set_up_date_time = Some(fields.set_up_date_time);
                permit.end_date_time = Some(fields.end_date_time);
                permit.participants = Some(fields.participants);
                permit.details = Some(fields.details);
                (permit, None)
            }
            Err(source) => {
                let failure = EnrichError {
                    number: permit.number.clone(),
                    url: permit.url.clone(),
                    source,
                };
                (permit, Some(failure))
            }
        }
    }

    async fn fetch_detail(&self, run_id: Uuid, url: &str) -> Result<DetailFields, ScrapeError> {
        let html = self.source.page_html(run_id, url).await?;
        Ok(parse_detail(&html, &self.config.fields)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubSource {
        pages: HashMap<String, String>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl StubSource {
        fn new(pages: Vec<(&str, &str)>) -> Self {
            Self {
                pages: pages
                    .into_iter()
                    .map(|(url, html)| (url.to_string(), html.to_string()))
                    .collect(),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageSource for StubSource {
        async fn page_html(&self, _run_id: Uuid, url: &str) -> Result<String, FetchError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                })
        }
    }

    fn detail_page(set_up: &str, end: &str, participants: &str, details: &str) -> String {
        format!(
            r#"<html><body>
            <div class="display-field">25-0101</div>
            <div class="display-field">Active</div>
            <div class="display-field">3/1/2025 9:00 AM</div>
            <div class="display-field">{set_up}</div>
            <div class="display-field">North Steps</div>
            <div class="display-field">{end}</div>
            <div class="display-field">{participants}</div>
            <div class="display-field">{details}</div>
            </body></html>"#
        )
    }

    fn skeletal(number: &str, url: &str) -> Permit {
        Permit {
            status: PermitStatus::Pending,
            number: number.to_string(),
            url: url.to_string(),
            event_sponsor: "Sponsor".to_string(),
            location_on_capitol_grounds: "West Steps".to_string(),
            start_date_time: "3/1/2025 9:00 AM".to_string(),
            set_up_date_time: None,
            end_date_time: None,
            participants: None,
            details: None,
        }
    }

    #[test]
    fn participants_strip_thousands_separators() {
        assert_eq!(parse_participants("1,234").unwrap(), 1234);
        assert_eq!(parse_participants("85").unwrap(), 85);
        assert!(matches!(
            parse_participants("about 50"),
            Err(ParseError::Participants { .. })
        ));
    }

    #[test]
    fn detail_map_failure_names_field_and_locator() {
        let html = r#"<div class="display-field">only one node</div>"#;
        let err = parse_detail(html, &DetailFieldMap::default()).unwrap_err();
        match err {
            ParseError::DetailField { field, locator } => {
                assert_eq!(field, "set_up_date_time");
                assert_eq!(locator, ".display-field[3]");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn enrich_settles_every_record_and_isolates_failures() {
        let detail = detail_page("3/1/2025 7:00 AM", "3/1/2025 5:00 PM", "1,234", "Rally");
        let source = StubSource::new(vec![
            ("https://example.test/Event/Details/1", detail.as_str()),
            ("https://example.test/Event/Details/3", detail.as_str()),
        ]);
        let enricher = DetailEnricher::new(&source, EnricherConfig::default());

        let batch = vec![
            skeletal("25-0001", "https://example.test/Event/Details/1"),
            skeletal("25-0002", "https://example.test/Event/Details/2"),
            skeletal("25-0003", "https://example.test/Event/Details/3"),
        ];
        let outcome = enricher.enrich(Uuid::new_v4(), batch).await;

        assert_eq!(outcome.permits.len(), 3);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].number, "25-0002");

        for permit in &outcome.permits {
            if permit.number == "25-0002" {
                assert!(!permit.is_enriched());
            } else {
                assert!(permit.is_enriched());
                assert_eq!(permit.participants, Some(1234));
                assert_eq!(permit.set_up_date_time.as_deref(), Some("3/1/2025 7:00 AM"));
            }
        }
    }

    #[tokio::test]
    async fn enrich_never_exceeds_the_concurrency_cap() {
        let detail = detail_page("7:00 AM", "5:00 PM", "10", "Vigil");
        let pages: Vec<(String, String)> = (0..8)
            .map(|i| (format!("https://example.test/Event/Details/{i}"), detail.clone()))
            .collect();
        let source = StubSource::new(
            pages
                .iter()
                .map(|(u, h)| (u.as_str(), h.as_str()))
                .collect(),
        );
        let enricher = DetailEnricher::new(&source, EnricherConfig::default());

        let batch: Vec<Permit> = (0..8)
            .map(|i| {
                skeletal(
                    &format!("25-000{i}"),
                    &format!("https://example.test/Event/Details/{i}"),
                )
            })
            .collect();
        let outcome = enricher.enrich(Uuid::new_v4(), batch).await;

        assert!(outcome.failures.is_empty());
        assert!(outcome.permits.iter().all(Permit::is_enriched));
        assert!(source.max_in_flight.load(Ordering::SeqCst) <= 2);
    }
}
