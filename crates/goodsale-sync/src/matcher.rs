use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use goodsale_core::{similar_from_candidates, ProductRecord, SimilarityUpdate};
use goodsale_search::SearchIndex;
use goodsale_storage::RecordStore;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Terminal state of one record's similarity lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Enriched(SimilarityUpdate),
    Skipped { source_id: i64 },
    Failed { uid: Uuid, error: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchSummary {
    pub pages: usize,
    /// Records whose similar ids were committed.
    pub enriched: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Records that were matched but whose page commit was rolled back.
    pub commit_failed: usize,
    /// Pages whose commit was rolled back.
    pub failed_pages: usize,
    /// Pages that could not be read from the store.
    pub unread_pages: usize,
}

/// Enriches every stored record with its nearest neighbours from the search index.
///
/// Pages are read in primary-key order. Within a page at most `concurrency_limit`
/// queries are outstanding, and the page's results are committed in one
/// transaction before the next page is read.
pub struct SimilarityMatcher {
    store: Arc<dyn RecordStore>,
    index: Arc<dyn SearchIndex>,
    permits: Arc<Semaphore>,
}

impl SimilarityMatcher {
    pub fn new(
        store: Arc<dyn RecordStore>,
        index: Arc<dyn SearchIndex>,
        concurrency_limit: usize,
    ) -> Self {
        Self {
            store,
            index,
            permits: Arc::new(Semaphore::new(concurrency_limit.max(1))),
        }
    }

    pub async fn process_all(&self, batch_size: usize) -> Result<MatchSummary> {
        let batch_size = batch_size.max(1) as u64;
        let total = self.store.count().await.context("counting stored records")?;
        info!(total, batch_size, "similarity matching started");

        let mut summary = MatchSummary::default();
        let mut offset = 0u64;
        while offset < total {
            let page = summary.pages;
            summary.pages += 1;
            self.process_page(offset, batch_size, &mut summary)
                .instrument(info_span!("match_page", page, offset))
                .await?;
            offset += batch_size;
        }

        info!(
            pages = summary.pages,
            enriched = summary.enriched,
            skipped = summary.skipped,
            failed = summary.failed,
            commit_failed = summary.commit_failed,
            failed_pages = summary.failed_pages,
            unread_pages = summary.unread_pages,
            "similarity matching finished"
        );
        Ok(summary)
    }

    async fn process_page(&self, offset: u64, limit: u64, summary: &mut MatchSummary) -> Result<()> {
        let records = match self.store.scan(offset, limit).await {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "could not read page, leaving it unenriched");
                summary.unread_pages += 1;
                return Ok(());
            }
        };

        let mut updates = Vec::with_capacity(records.len());
        for outcome in self.query_page(records).await? {
            match outcome {
                MatchOutcome::Enriched(update) => updates.push(update),
                MatchOutcome::Skipped { .. } => summary.skipped += 1,
                MatchOutcome::Failed { .. } => summary.failed += 1,
            }
        }

        if updates.is_empty() {
            debug!("nothing to commit");
            return Ok(());
        }
        match self.store.update_similarity(&updates).await {
            Ok(()) => {
                debug!(records = updates.len(), "page committed");
                summary.enriched += updates.len();
            }
            Err(err) => {
                error!(records = updates.len(), error = %err, "page commit failed, rolled back");
                summary.commit_failed += updates.len();
                summary.failed_pages += 1;
            }
        }
        Ok(())
    }

    /// Queries every record of the page and waits for all of them.
    pub(crate) async fn query_page(&self, records: Vec<ProductRecord>) -> Result<Vec<MatchOutcome>> {
        let mut outcomes = Vec::with_capacity(records.len());
        let mut tasks = JoinSet::new();
        let mut in_flight = HashMap::new();

        for record in records {
            let Some(uid) = record.uid else {
                warn!(source_id = record.source_id, "record without uid, skipping");
                outcomes.push(MatchOutcome::Skipped {
                    source_id: record.source_id,
                });
                continue;
            };
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .context("similarity permits closed")?;
            let index = self.index.clone();
            let handle = tasks.spawn(
                async move {
                    let outcome = match_one(index.as_ref(), uid).await;
                    drop(permit);
                    outcome
                }
                .in_current_span(),
            );
            in_flight.insert(handle.id(), uid);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, outcome)) => outcomes.push(outcome),
                Err(err) => {
                    let uid = in_flight.get(&err.id()).copied().unwrap_or_default();
                    error!(%uid, error = %err, "similarity task aborted");
                    outcomes.push(MatchOutcome::Failed {
                        uid,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(outcomes)
    }
}

async fn match_one(index: &dyn SearchIndex, uid: Uuid) -> MatchOutcome {
    match index.find_similar(uid).await {
        Ok(candidates) => {
            let similar_ids = similar_from_candidates(uid, candidates);
            debug!(%uid, similar = similar_ids.len(), "similar records found");
            MatchOutcome::Enriched(SimilarityUpdate { uid, similar_ids })
        }
        Err(err) => {
            error!(%uid, error = %err, "similarity query failed");
            MatchOutcome::Failed {
                uid,
                error: err.to_string(),
            }
        }
    }
}
