//! Remote data source for the perpsync engine.
//!
//! - `source`: the `ChainReader` / `ChainWriter` seams the engine reads and
//!   writes through, plus the write intents it forwards
//! - `retry`: exponential backoff with jitter around any remote read
//! - `fallback`: ordered producer strategies, first success wins
//! - `decode`: record-by-record decoding with per-record isolation
//! - `gateway`: JSON-over-HTTP implementation of both seams
//! - `mock`: scripted in-process chain for tests and dry runs

pub mod decode;
pub mod fallback;
pub mod gateway;
pub mod mock;
pub mod rate_limiter;
pub mod retry;
pub mod source;

pub use decode::{decode_ids, decode_int, decode_record, decode_records};
pub use fallback::FallbackChain;
pub use gateway::{GatewayClient, GatewayConfig};
pub use mock::MockChain;
pub use rate_limiter::RateLimiter;
pub use retry::{RetryPolicy, RetryScheduler};
pub use source::{
    ops, BoxFuture, ChainReader, ChainWriter, DynChainReader, DynChainWriter, PendingTx,
    TxReceipt, TxStatus, WriteIntent,
};
