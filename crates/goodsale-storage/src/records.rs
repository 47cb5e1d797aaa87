use std::collections::BTreeMap;

use async_trait::async_trait;
use goodsale_core::{Breadcrumb, ProductRecord, SimilarityUpdate};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::{debug, error, info};

/// Rows per multi-row INSERT; keeps bind parameters well under the Postgres limit.
const INSERT_CHUNK: usize = 1000;

pub(crate) const SKU_COLUMNS: &[&str] = &[
    "uuid",
    "marketplace_id",
    "product_id",
    "title",
    "description",
    "brand",
    "seller_id",
    "seller_name",
    "first_image_url",
    "category_id",
    "category_lvl_1",
    "category_lvl_2",
    "category_lvl_3",
    "category_remaining",
    "features",
    "price_before_discounts",
    "price_after_discounts",
    "discount",
    "currency",
    "barcode",
    "similar_sku",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error")]
    Database(#[from] sqlx::Error),
    #[error("running migrations")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Durable record table consumed by the pipeline.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn count(&self) -> Result<u64, StoreError>;

    /// Page of records in primary-key order.
    async fn scan(&self, offset: u64, limit: u64) -> Result<Vec<ProductRecord>, StoreError>;

    /// Insert every record carrying a uid in one transaction; returns the number inserted.
    async fn insert_all(&self, records: &[ProductRecord]) -> Result<u64, StoreError>;

    /// Persist `similar_ids` for the whole batch or for none of it.
    async fn update_similarity(&self, batch: &[SimilarityUpdate]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("sku schema migrated");
        Ok(())
    }
}

fn select_sql() -> String {
    format!(
        "SELECT {} FROM sku ORDER BY uuid OFFSET $1 LIMIT $2",
        SKU_COLUMNS.join(", ")
    )
}

fn record_from_row(row: &PgRow) -> Result<ProductRecord, sqlx::Error> {
    let features: Option<Json<BTreeMap<String, String>>> = row.try_get("features")?;
    Ok(ProductRecord {
        uid: row.try_get("uuid")?,
        marketplace_id: row.try_get::<Option<i32>, _>("marketplace_id")?.unwrap_or_default(),
        source_id: row.try_get("product_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        brand: row.try_get("brand")?,
        seller_id: row.try_get("seller_id")?,
        seller_name: row.try_get("seller_name")?,
        image_url: row.try_get("first_image_url")?,
        category_id: row.try_get::<Option<i64>, _>("category_id")?.unwrap_or_default(),
        breadcrumb: Breadcrumb {
            l1: row.try_get("category_lvl_1")?,
            l2: row.try_get("category_lvl_2")?,
            l3: row.try_get("category_lvl_3")?,
            remaining: row.try_get("category_remaining")?,
        },
        features: features.map(|Json(map)| map).unwrap_or_default(),
        price_before: row.try_get("price_before_discounts")?,
        price_after: row.try_get("price_after_discounts")?,
        discount_pct: row.try_get("discount")?,
        currency: row.try_get("currency")?,
        barcode: row.try_get("barcode")?,
        similar_ids: row.try_get("similar_sku")?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn count(&self) -> Result<u64, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sku")
            .fetch_one(&self.pool)
            .await?;
        Ok(total.max(0) as u64)
    }

    async fn scan(&self, offset: u64, limit: u64) -> Result<Vec<ProductRecord>, StoreError> {
        let rows = sqlx::query(&select_sql())
            .bind(offset as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    async fn insert_all(&self, records: &[ProductRecord]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for chunk in records.chunks(INSERT_CHUNK) {
            let rows = chunk
                .iter()
                .filter_map(|record| match record.uid {
                    Some(uid) => Some((uid, record)),
                    None => {
                        error!(source_id = record.source_id, "record without uid, not inserting");
                        None
                    }
                })
                .collect::<Vec<_>>();
            if rows.is_empty() {
                continue;
            }

            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO sku ({}) ", SKU_COLUMNS.join(", ")));
            builder.push_values(rows.iter(), |mut b, (uid, record)| {
                b.push_bind(*uid)
                    .push_bind(record.marketplace_id)
                    .push_bind(record.source_id)
                    .push_bind(record.title.clone())
                    .push_bind(record.description.clone())
                    .push_bind(record.brand.clone())
                    .push_bind(record.seller_id)
                    .push_bind(record.seller_name.clone())
                    .push_bind(record.image_url.clone())
                    .push_bind(record.category_id)
                    .push_bind(record.breadcrumb.l1.clone())
                    .push_bind(record.breadcrumb.l2.clone())
                    .push_bind(record.breadcrumb.l3.clone())
                    .push_bind(record.breadcrumb.remaining.clone())
                    .push_bind(Json(record.features.clone()))
                    .push_bind(record.price_before)
                    .push_bind(record.price_after)
                    .push_bind(record.discount_pct)
                    .push_bind(record.currency.clone())
                    .push_bind(record.barcode.clone())
                    .push_bind(record.similar_ids.clone());
            });
            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        info!(inserted, "records inserted");
        Ok(inserted)
    }

    async fn update_similarity(&self, batch: &[SimilarityUpdate]) -> Result<(), StoreError> {
        // Dropping the transaction on any error below rolls the whole batch back.
        let mut tx = self.pool.begin().await?;
        for update in batch {
            let result = sqlx::query(
                r#"
                UPDATE sku
                   SET similar_sku = $1,
                       updated_at = NOW()
                 WHERE uuid = $2
                "#,
            )
            .bind(update.similar_ids.as_slice())
            .bind(update.uid)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                debug!(uid = %update.uid, "no sku row for similarity update");
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
