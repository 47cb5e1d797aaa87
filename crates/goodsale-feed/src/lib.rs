//! Streaming reader for the XML catalog feed.
//!
//! The feed is walked once with a pull parser. Category blocks are folded into a
//! [`Taxonomy`] as soon as they close; each `<offer>` is turned into a
//! [`ProductRecord`] when its end tag is reached and its buffers are dropped before the
//! next event is read.

mod taxonomy;

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use goodsale_core::{Breadcrumb, ProductRecord};
use goodsale_storage::{FetchError, HttpFetcher};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub use taxonomy::{CategoryNode, Taxonomy};

pub const CRATE_NAME: &str = "goodsale-feed";

const READ_BUFFER_BYTES: usize = 1024 * 1024;

/// A single offer could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseFieldError {
    #[error("missing required field `{0}`")]
    Missing(&'static str),
    #[error("field `{field}` is not numeric: {value:?}")]
    NotNumeric { field: &'static str, value: String },
    #[error("malformed `{element}` markup: {detail}")]
    Malformed { element: String, detail: String },
}

/// The rest of the feed cannot be read.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("malformed feed xml near byte {position}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },
    #[error("opening feed file {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Where the feed document comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedLocation {
    Remote(String),
    Local(PathBuf),
}

impl FeedLocation {
    pub fn parse(location: &str) -> Self {
        let location = location.trim();
        if location.starts_with("http://") || location.starts_with("https://") {
            Self::Remote(location.to_string())
        } else {
            Self::Local(PathBuf::from(location.trim_start_matches("file://")))
        }
    }
}

impl std::fmt::Display for FeedLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(url) => f.write_str(url),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Fetch the whole feed document. This is the only I/O the feed stage performs.
pub async fn load_feed(http: &HttpFetcher, location: &FeedLocation) -> Result<Vec<u8>, FeedError> {
    let span = info_span!("feed_fetch", location = %location);
    async move {
        let bytes = match location {
            FeedLocation::Remote(url) => http.fetch_bytes(url).await?.body,
            FeedLocation::Local(path) => {
                tokio::fs::read(path)
                    .await
                    .map_err(|source| FeedError::Open {
                        path: path.clone(),
                        source,
                    })?
            }
        };
        info!(bytes = bytes.len(), "feed loaded");
        Ok(bytes)
    }
    .instrument(span)
    .await
}

/// Direct children of one `<offer>` element, before conversion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOffer {
    pub id: Option<String>,
    /// First non-empty text per child element name.
    pub fields: HashMap<String, String>,
    /// `<param name="..">value</param>` pairs; later names overwrite earlier ones.
    pub params: BTreeMap<String, String>,
}

impl RawOffer {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    fn text(&self, name: &str) -> Option<String> {
        self.field(name).map(str::to_string)
    }

    fn set_field(&mut self, name: String, text: String) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.fields.entry(name).or_insert_with(|| text.to_string());
    }
}

/// Convert one offer into a canonical record, resolving its breadcrumb against `taxonomy`.
pub fn parse_offer(raw: &RawOffer, taxonomy: &Taxonomy) -> Result<ProductRecord, ParseFieldError> {
    let source_id = parse_i64(raw.id.as_deref(), "id")?;
    let category_id = parse_i64(raw.field("categoryId"), "categoryId")?;
    let price_after = parse_price(raw.field("price"), "price")?;
    let price_before = parse_price(raw.field("oldprice"), "oldprice")?.or(price_after);

    let mut record = ProductRecord::new(source_id, category_id);
    record.title = raw.text("name");
    record.description = raw.text("description");
    record.brand = raw.text("vendor");
    record.seller_name = raw.text("vendorCode");
    record.image_url = raw.text("picture");
    record.currency = raw.text("currencyId");
    record.barcode = raw.text("barcode");
    record.set_prices(price_before, price_after);
    record.features = raw.params.clone();

    let path = taxonomy.path_of(&category_id.to_string());
    if path.is_empty() {
        debug!(source_id, category_id, "category not in taxonomy, breadcrumb left empty");
    }
    record.breadcrumb = Breadcrumb::from_path(&path);

    Ok(record)
}

fn parse_i64(value: Option<&str>, field: &'static str) -> Result<i64, ParseFieldError> {
    let value = value.ok_or(ParseFieldError::Missing(field))?;
    value.parse().map_err(|_| ParseFieldError::NotNumeric {
        field,
        value: value.to_string(),
    })
}

fn parse_price(value: Option<&str>, field: &'static str) -> Result<Option<f64>, ParseFieldError> {
    let Some(value) = value else {
        return Ok(None);
    };
    match value.parse::<f64>() {
        Ok(price) if price.is_finite() => Ok(Some(price)),
        _ => Err(ParseFieldError::NotNumeric {
            field,
            value: value.to_string(),
        }),
    }
}

/// Result of reading one offer element.
#[derive(Debug, Clone, PartialEq)]
pub enum OfferOutcome {
    Parsed(ProductRecord),
    Skipped {
        source_id: Option<String>,
        reason: ParseFieldError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedStats {
    pub categories: usize,
    pub offers_parsed: usize,
    pub offers_skipped: usize,
}

#[derive(Debug)]
struct PartialCategory {
    id: Option<String>,
    parent_id: Option<String>,
    name: String,
}

#[derive(Debug)]
struct OfferChild {
    name: String,
    param_name: Option<String>,
    text: String,
}

#[derive(Debug, Default)]
struct PartialOffer {
    raw: RawOffer,
    depth: usize,
    child: Option<OfferChild>,
    /// First markup problem seen inside the offer; the offer is skipped when set.
    defect: Option<ParseFieldError>,
}

impl PartialOffer {
    fn open(e: &BytesStart<'_>) -> Self {
        let mut offer = Self::default();
        match attr(e, "id") {
            Ok(id) => offer.raw.id = id,
            Err(err) => offer.flag("offer", &err),
        }
        offer
    }

    fn flag(&mut self, element: &str, err: &quick_xml::Error) {
        if self.defect.is_none() {
            self.defect = Some(ParseFieldError::Malformed {
                element: element.to_string(),
                detail: err.to_string(),
            });
        }
    }

    fn open_child(&mut self, e: &BytesStart<'_>) -> OfferChild {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
        let param_name = if name == "param" {
            match attr(e, "name") {
                Ok(param_name) => param_name,
                Err(err) => {
                    self.flag("param", &err);
                    None
                }
            }
        } else {
            None
        };
        OfferChild {
            name,
            param_name,
            text: String::new(),
        }
    }

    fn finish_child(&mut self, child: OfferChild) {
        match child.param_name {
            Some(name) if child.name == "param" => {
                self.raw.params.insert(name, child.text.trim().to_string());
            }
            _ => self.raw.set_field(child.name, child.text),
        }
    }
}

#[derive(Debug)]
enum Scope {
    Document,
    Categories {
        pending: Vec<CategoryNode>,
        current: Option<PartialCategory>,
    },
    Offer(PartialOffer),
}

/// Lazy, single-pass iterator over the offers of a feed document.
///
/// Yields `Err` at most once, for a document that is not well-formed XML, and is
/// exhausted afterwards. A new reader must be opened to read the feed again.
pub struct FeedReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    taxonomy: Taxonomy,
    scope: Scope,
    stats: FeedStats,
    done: bool,
}

impl<'a> FeedReader<&'a [u8]> {
    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        Self::new(bytes)
    }
}

impl FeedReader<BufReader<File>> {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| FeedError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(BufReader::with_capacity(READ_BUFFER_BYTES, file)))
    }
}

impl<R: BufRead> FeedReader<R> {
    pub fn new(source: R) -> Self {
        let mut reader = Reader::from_reader(source);
        let config = reader.config_mut();
        config.trim_text(true);
        // Mismatched closing tags are read by depth, not rejected.
        config.check_end_names = false;
        Self {
            reader,
            buf: Vec::with_capacity(8192),
            taxonomy: Taxonomy::default(),
            scope: Scope::Document,
            stats: FeedStats::default(),
            done: false,
        }
    }

    pub fn stats(&self) -> FeedStats {
        self.stats
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// Only the successfully parsed records; skipped offers have already been logged.
    pub fn records(self) -> impl Iterator<Item = Result<ProductRecord, FeedError>> {
        self.filter_map(|item| match item {
            Ok(OfferOutcome::Parsed(record)) => Some(Ok(record)),
            Ok(OfferOutcome::Skipped { .. }) => None,
            Err(err) => Some(Err(err)),
        })
    }

    fn next_outcome(&mut self, buf: &mut Vec<u8>) -> Result<Option<OfferOutcome>, quick_xml::Error> {
        loop {
            buf.clear();
            match self.reader.read_event_into(buf)? {
                Event::Start(e) => self.on_start(&e),
                Event::Empty(e) => {
                    if let Some(outcome) = self.on_empty(&e) {
                        return Ok(Some(outcome));
                    }
                }
                Event::Text(t) => match t.unescape() {
                    Ok(text) => self.on_text(&text),
                    Err(err) => self.on_undecodable_text(&String::from_utf8_lossy(&t), &err),
                },
                Event::CData(c) => self.on_text(&String::from_utf8_lossy(&c.into_inner())),
                Event::End(e) => {
                    if let Some(outcome) = self.on_end(e.local_name().as_ref()) {
                        return Ok(Some(outcome));
                    }
                }
                Event::Eof => {
                    if matches!(self.scope, Scope::Offer(_)) {
                        warn!("feed ended inside an offer element, dropping it");
                    }
                    info!(
                        categories = self.stats.categories,
                        parsed = self.stats.offers_parsed,
                        skipped = self.stats.offers_skipped,
                        "feed read complete"
                    );
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    fn on_start(&mut self, e: &BytesStart<'_>) {
        let name = e.local_name();
        match &mut self.scope {
            Scope::Document => match name.as_ref() {
                b"categories" => {
                    self.scope = Scope::Categories {
                        pending: Vec::new(),
                        current: None,
                    };
                }
                b"offer" => self.scope = Scope::Offer(PartialOffer::open(e)),
                _ => {}
            },
            Scope::Categories { current, .. } => {
                if name.as_ref() == b"category" {
                    *current = open_category(e);
                }
            }
            Scope::Offer(offer) => {
                offer.depth += 1;
                if offer.depth == 1 {
                    offer.child = Some(offer.open_child(e));
                }
            }
        }
    }

    fn on_empty(&mut self, e: &BytesStart<'_>) -> Option<OfferOutcome> {
        let name = e.local_name();
        match &mut self.scope {
            Scope::Document => {
                if name.as_ref() == b"offer" {
                    return Some(self.finish_offer(PartialOffer::open(e)));
                }
            }
            Scope::Categories { pending, .. } => {
                if name.as_ref() == b"category" {
                    if let Some(node) = open_category(e).and_then(category_node) {
                        pending.push(node);
                    }
                }
            }
            Scope::Offer(offer) => {
                if offer.depth == 0 {
                    let child = offer.open_child(e);
                    offer.finish_child(child);
                }
            }
        }
        None
    }

    fn on_text(&mut self, text: &str) {
        match &mut self.scope {
            Scope::Categories {
                current: Some(category),
                ..
            } => category.name.push_str(text),
            Scope::Offer(offer) if offer.depth == 1 => {
                if let Some(child) = offer.child.as_mut() {
                    child.text.push_str(text);
                }
            }
            _ => {}
        }
    }

    /// Text with an unknown entity: the enclosing offer is skipped, elsewhere the raw text is kept.
    fn on_undecodable_text(&mut self, raw: &str, err: &quick_xml::Error) {
        if let Scope::Offer(offer) = &mut self.scope {
            let element = offer
                .child
                .as_ref()
                .filter(|_| offer.depth == 1)
                .map(|child| child.name.clone())
                .unwrap_or_else(|| "offer".to_string());
            offer.flag(&element, err);
            return;
        }
        warn!(error = %err, text = raw, "undecodable text outside offers, keeping it raw");
        self.on_text(raw);
    }

    fn on_end(&mut self, name: &[u8]) -> Option<OfferOutcome> {
        match &mut self.scope {
            Scope::Document => None,
            Scope::Categories { pending, current } => {
                match name {
                    b"category" => {
                        if let Some(node) = current.take().and_then(category_node) {
                            pending.push(node);
                        }
                    }
                    b"categories" => {
                        let nodes = std::mem::take(pending);
                        self.stats.categories += nodes.len();
                        self.taxonomy.extend(nodes);
                        info!(
                            categories = self.taxonomy.len(),
                            "category block resolved"
                        );
                        self.scope = Scope::Document;
                    }
                    _ => {}
                }
                None
            }
            Scope::Offer(offer) => {
                if offer.depth == 0 {
                    let offer = std::mem::take(offer);
                    self.scope = Scope::Document;
                    return Some(self.finish_offer(offer));
                }
                if offer.depth == 1 {
                    if let Some(child) = offer.child.take() {
                        offer.finish_child(child);
                    }
                }
                offer.depth -= 1;
                None
            }
        }
    }

    fn finish_offer(&mut self, offer: PartialOffer) -> OfferOutcome {
        let PartialOffer { raw, defect, .. } = offer;
        let parsed = match defect {
            Some(reason) => Err(reason),
            None => parse_offer(&raw, &self.taxonomy),
        };
        match parsed {
            Ok(record) => {
                self.stats.offers_parsed += 1;
                OfferOutcome::Parsed(record)
            }
            Err(reason) => {
                self.stats.offers_skipped += 1;
                warn!(source_id = ?raw.id, %reason, "skipping offer");
                OfferOutcome::Skipped {
                    source_id: raw.id,
                    reason,
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for FeedReader<R> {
    type Item = Result<OfferOutcome, FeedError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = std::mem::take(&mut self.buf);
        let result = self.next_outcome(&mut buf);
        self.buf = buf;

        match result {
            Ok(Some(outcome)) => Some(Ok(outcome)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(source) => {
                self.done = true;
                Some(Err(FeedError::Xml {
                    position: self.reader.buffer_position() as u64,
                    source,
                }))
            }
        }
    }
}

fn attr(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, quick_xml::Error> {
    let Some(attribute) = e.try_get_attribute(name)? else {
        return Ok(None);
    };
    let value = attribute.unescape_value()?;
    let value = value.trim();
    Ok((!value.is_empty()).then(|| value.to_string()))
}

fn open_category(e: &BytesStart<'_>) -> Option<PartialCategory> {
    match (attr(e, "id"), attr(e, "parentId")) {
        (Ok(id), Ok(parent_id)) => Some(PartialCategory {
            id,
            parent_id,
            name: String::new(),
        }),
        (Err(err), _) | (_, Err(err)) => {
            warn!(error = %err, "malformed category attributes, ignoring category");
            None
        }
    }
}

fn category_node(partial: PartialCategory) -> Option<CategoryNode> {
    let Some(id) = partial.id else {
        warn!(name = %partial.name.trim(), "category without id, ignoring");
        return None;
    };
    Some(CategoryNode {
        id,
        parent_id: partial.parent_id,
        name: partial.name.trim().to_string(),
    })
}
