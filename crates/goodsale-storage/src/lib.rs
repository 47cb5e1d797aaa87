//! Feed download and durable record storage for Goodsale.

mod fetch;
mod records;

pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use records::{PgRecordStore, RecordStore, StoreError};

pub const CRATE_NAME: &str = "goodsale-storage";
