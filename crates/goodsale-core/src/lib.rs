//! Core catalog model shared by the feed reader, storage, search and sync crates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "goodsale-core";

/// Marketplace key stamped on every record produced from the XML feed.
pub const FEED_MARKETPLACE_ID: i32 = 1;

/// Upper bound on `ProductRecord::similar_ids`.
pub const MAX_SIMILAR: usize = 5;

/// Number of category levels flattened into dedicated breadcrumb columns.
const BREADCRUMB_LEVELS: usize = 3;

/// Flattened category path attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub l1: Option<String>,
    pub l2: Option<String>,
    pub l3: Option<String>,
    /// `/`-joined levels beyond the third, `None` when the path is three levels or shorter.
    pub remaining: Option<String>,
}

impl Breadcrumb {
    pub fn from_path(path: &[String]) -> Self {
        let level = |i: usize| path.get(i).cloned();
        let remaining = if path.len() > BREADCRUMB_LEVELS {
            Some(path[BREADCRUMB_LEVELS..].join("/"))
        } else {
            None
        };
        Self {
            l1: level(0),
            l2: level(1),
            l3: level(2),
            remaining,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.l1.is_none()
    }
}

/// Canonical persisted representation of one feed offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub uid: Option<Uuid>,
    pub marketplace_id: i32,
    pub source_id: i64,
    pub title: Option<String>,
    pub description: Option<String>,
    pub brand: Option<String>,
    pub seller_id: Option<i64>,
    pub seller_name: Option<String>,
    pub image_url: Option<String>,
    pub category_id: i64,
    pub breadcrumb: Breadcrumb,
    pub features: BTreeMap<String, String>,
    pub price_before: Option<f64>,
    pub price_after: Option<f64>,
    pub discount_pct: Option<f64>,
    pub currency: Option<String>,
    pub barcode: Option<String>,
    pub similar_ids: Vec<Uuid>,
}

impl ProductRecord {
    /// New feed record with a freshly assigned uid and no enrichment.
    pub fn new(source_id: i64, category_id: i64) -> Self {
        Self {
            uid: Some(Uuid::new_v4()),
            marketplace_id: FEED_MARKETPLACE_ID,
            source_id,
            title: None,
            description: None,
            brand: None,
            seller_id: None,
            seller_name: None,
            image_url: None,
            category_id,
            breadcrumb: Breadcrumb::default(),
            features: BTreeMap::new(),
            price_before: None,
            price_after: None,
            discount_pct: None,
            currency: None,
            barcode: None,
            similar_ids: Vec::new(),
        }
    }

    /// Set both prices and recompute the derived discount.
    pub fn set_prices(&mut self, price_before: Option<f64>, price_after: Option<f64>) {
        self.price_before = price_before;
        self.price_after = price_after;
        self.discount_pct = discount_pct(price_before, price_after);
    }
}

/// Percentage markdown from `before` to `after`; defined only when both are present and `before > 0`.
pub fn discount_pct(before: Option<f64>, after: Option<f64>) -> Option<f64> {
    match (before, after) {
        (Some(before), Some(after)) if before > 0.0 => Some((before - after) / before * 100.0),
        _ => None,
    }
}

/// Drop `own` from a ranked candidate list and keep at most [`MAX_SIMILAR`] ids.
pub fn similar_from_candidates(own: Uuid, candidates: impl IntoIterator<Item = Uuid>) -> Vec<Uuid> {
    candidates
        .into_iter()
        .filter(|id| *id != own)
        .take(MAX_SIMILAR)
        .collect()
}

/// One row of an enrichment commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimilarityUpdate {
    pub uid: Uuid,
    pub similar_ids: Vec<Uuid>,
}
