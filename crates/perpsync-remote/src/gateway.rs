//! JSON-over-HTTP gateway client.
//!
//! Every remote view function is exposed as `POST {"method", "params"}`
//! returning `{"result"}` or `{"error": {"code", "message"}}`. Integers travel
//! as decimal strings. Reads try each configured endpoint in order; writes go
//! to the primary endpoint only and are never replayed elsewhere.

use crate::decode::{decode_ids, decode_int, decode_record, decode_records};
use crate::fallback::FallbackChain;
use crate::rate_limiter::RateLimiter;
use crate::source::{
    ops, BoxFuture, ChainReader, ChainWriter, PendingTx, TxReceipt, WriteIntent,
};
use perpsync_core::{
    MarketId, OrderId, OrderSide, RawBestPrices, RawDepth, RawLiquidation, RawMarginSummary,
    RawMarketPrice, RawOrder, RawPosition, SyncError, SyncResult, UserAddress,
};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Gateway client configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Primary endpoint first, fallbacks after.
    pub endpoints: Vec<String>,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Requests allowed per `rate_window` (0 = unlimited).
    pub max_requests: u32,
    pub rate_window: Duration,
    pub receipt_poll_interval: Duration,
    /// Give up waiting for a receipt after this long.
    pub receipt_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            request_timeout: Duration::from_secs(15),
            max_requests: 600,
            rate_window: Duration::from_secs(60),
            receipt_poll_interval: Duration::from_secs(1),
            receipt_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Serialize)]
struct GatewayRequest<'a> {
    method: &'a str,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<GatewayErrorBody>,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Client for the view/transaction gateway.
pub struct GatewayClient {
    client: Client,
    config: GatewayConfig,
    limiter: RateLimiter,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> SyncResult<Self> {
        if config.endpoints.is_empty() {
            return Err(SyncError::Config("no gateway endpoints configured".to_string()));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {e}")))?;

        info!(
            primary = %config.endpoints[0],
            fallbacks = config.endpoints.len() - 1,
            "Gateway client created"
        );
        let limiter = RateLimiter::new(config.max_requests, config.rate_window);
        Ok(Self {
            client,
            config,
            limiter,
        })
    }

    fn primary(&self) -> &str {
        self.config.endpoints.first().map(String::as_str).unwrap_or_default()
    }

    /// Read call, tried against every endpoint in order.
    async fn call(&self, method: &'static str, params: Value) -> SyncResult<Value> {
        let params = &params;
        let chain = self
            .config
            .endpoints
            .iter()
            .fold(FallbackChain::new(method), |chain, url| {
                chain.then(url.clone(), move || Box::pin(self.post(url, method, params)))
            });
        chain.run().await
    }

    async fn post(&self, url: &str, method: &str, params: &Value) -> SyncResult<Value> {
        self.limiter.acquire().await;
        debug!(url, method, "Gateway request");

        let response = self
            .client
            .post(url)
            .json(&GatewayRequest { method, params })
            .send()
            .await
            .map_err(|e| self.transport_error(method, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(method, status, &body));
        }

        let body: GatewayResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Decode(format!("{method}: failed to parse response: {e}")))?;
        unwrap_response(method, body)
    }

    fn transport_error(&self, method: &str, e: &reqwest::Error) -> SyncError {
        if e.is_timeout() {
            SyncError::Timeout(self.config.request_timeout)
        } else {
            SyncError::TransientNetwork(format!("{method}: HTTP request failed: {e}"))
        }
    }

    async fn poll_receipt(&self, tx: &PendingTx) -> SyncResult<TxReceipt> {
        let params = json!([tx.hash]);
        loop {
            match self.post(self.primary(), ops::TX_RECEIPT, &params).await {
                Ok(Value::Null) => {}
                Ok(value) => return decode_record(value),
                Err(e) if e.is_retryable() => {
                    warn!(tx = %tx, error = %e, "Receipt poll failed, polling again");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.config.receipt_poll_interval).await;
        }
    }
}

impl ChainReader for GatewayClient {
    fn user_positions(&self, user: UserAddress) -> BoxFuture<'_, SyncResult<Vec<RawPosition>>> {
        Box::pin(async move {
            let value = self.call(ops::USER_POSITIONS, json!([user])).await?;
            decode_records("positions", value)
        })
    }

    fn market_price(&self, market: MarketId) -> BoxFuture<'_, SyncResult<RawMarketPrice>> {
        Box::pin(async move { decode_record(self.call(ops::MARKET_PRICE, json!([market])).await?) })
    }

    fn liquidation(
        &self,
        user: UserAddress,
        market: MarketId,
    ) -> BoxFuture<'_, SyncResult<RawLiquidation>> {
        Box::pin(async move {
            decode_record(self.call(ops::LIQUIDATION, json!([user, market])).await?)
        })
    }

    fn margin_summary(&self, user: UserAddress) -> BoxFuture<'_, SyncResult<RawMarginSummary>> {
        Box::pin(async move { decode_record(self.call(ops::MARGIN_SUMMARY, json!([user])).await?) })
    }

    fn user_orders(&self, user: UserAddress) -> BoxFuture<'_, SyncResult<Vec<OrderId>>> {
        Box::pin(async move { decode_ids(self.call(ops::USER_ORDERS, json!([user])).await?) })
    }

    fn order(&self, id: OrderId) -> BoxFuture<'_, SyncResult<RawOrder>> {
        Box::pin(async move {
            decode_record(self.call(ops::ORDER, json!([id.0.to_string()])).await?)
        })
    }

    fn filled_amount(&self, id: OrderId) -> BoxFuture<'_, SyncResult<i128>> {
        Box::pin(async move {
            decode_int(&self.call(ops::FILLED_AMOUNT, json!([id.0.to_string()])).await?)
        })
    }

    fn best_prices(&self) -> BoxFuture<'_, SyncResult<RawBestPrices>> {
        Box::pin(async move { decode_record(self.call(ops::BEST_PRICES, json!([])).await?) })
    }

    fn book_depth(&self, levels: u32) -> BoxFuture<'_, SyncResult<RawDepth>> {
        Box::pin(async move { decode_record(self.call(ops::BOOK_DEPTH, json!([levels])).await?) })
    }
}

impl ChainWriter for GatewayClient {
    fn submit(
        &self,
        user: UserAddress,
        intent: WriteIntent,
    ) -> BoxFuture<'_, SyncResult<PendingTx>> {
        Box::pin(async move {
            let method = intent.method();
            let params = intent_params(&user, &intent);
            let value = self
                .post(self.primary(), method, &params)
                .await
                .map_err(|e| match e {
                    SyncError::Decode(msg) => SyncError::WriteRejected(msg),
                    other => other,
                })?;
            let tx: PendingTx = decode_record(value)?;
            info!(method, %user, tx = %tx, "Write submitted");
            Ok(tx)
        })
    }

    fn confirm(&self, tx: PendingTx) -> BoxFuture<'_, SyncResult<TxReceipt>> {
        Box::pin(async move {
            let timeout = self.config.receipt_timeout;
            tokio::time::timeout(timeout, self.poll_receipt(&tx))
                .await
                .unwrap_or(Err(SyncError::Timeout(timeout)))
        })
    }
}

/// Write parameters: the intent's integers as-is, as decimal strings.
fn intent_params(user: &UserAddress, intent: &WriteIntent) -> Value {
    match intent {
        WriteIntent::PlaceMarketOrder {
            market_id,
            side,
            size,
        } => json!({
            "from": user,
            "marketId": market_id,
            "isBuy": *side == OrderSide::Buy,
            "size": size.raw().to_string(),
        }),
        WriteIntent::PlaceLimitOrder {
            market_id,
            side,
            price,
            size,
        } => json!({
            "from": user,
            "marketId": market_id,
            "isBuy": *side == OrderSide::Buy,
            "price": price.raw().to_string(),
            "size": size.raw().to_string(),
        }),
        WriteIntent::CancelOrder { order_id } => json!({
            "from": user,
            "orderId": order_id.0.to_string(),
        }),
        WriteIntent::DepositCollateral { amount } | WriteIntent::WithdrawCollateral { amount } => {
            json!({
                "from": user,
                "amount": amount.raw().to_string(),
            })
        }
    }
}

/// Non-2xx status: 5xx and 429 are worth retrying, anything else is not.
fn classify_status(method: &str, status: StatusCode, body: &str) -> SyncError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        SyncError::TransientNetwork(format!("{method}: HTTP {status}: {body}"))
    } else {
        SyncError::Decode(format!("{method}: HTTP {status}: {body}"))
    }
}

fn unwrap_response(method: &str, response: GatewayResponse) -> SyncResult<Value> {
    if let Some(error) = response.error {
        // -32000..-32099: node-side failure (busy, upstream unavailable)
        let transient = (-32099..=-32000).contains(&error.code) || error.code == 429;
        let msg = format!("{method}: error {}: {}", error.code, error.message);
        return Err(if transient {
            SyncError::TransientNetwork(msg)
        } else {
            SyncError::Decode(msg)
        });
    }
    Ok(response.result.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use perpsync_core::{FixedPoint, Scale};

    fn user() -> UserAddress {
        "0x00000000000000000000000000000000000000aa".parse().unwrap()
    }

    #[test]
    fn test_requires_an_endpoint() {
        assert!(matches!(
            GatewayClient::new(GatewayConfig::default()),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn test_request_body_shape() {
        let params = json!(["0x00000000000000000000000000000000000000aa"]);
        let body = serde_json::to_value(GatewayRequest {
            method: ops::USER_POSITIONS,
            params: &params,
        })
        .unwrap();
        assert_eq!(body["method"], "getUserPositions");
        assert_eq!(body["params"][0], "0x00000000000000000000000000000000000000aa");
    }

    #[test]
    fn test_intent_params_forward_raw_integers() {
        let intent = WriteIntent::PlaceLimitOrder {
            market_id: MarketId::new("ETH").unwrap(),
            side: OrderSide::Sell,
            price: FixedPoint::new(2_500_123_456, Scale::USD),
            size: FixedPoint::new(1_500_000_000_000_000_000, Scale::WAD),
        };
        let params = intent_params(&user(), &intent);
        assert_eq!(params["isBuy"], false);
        assert_eq!(params["price"], "2500123456");
        assert_eq!(params["size"], "1500000000000000000");
        assert_eq!(params["from"], user().to_string());
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status("m", StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(classify_status("m", StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!classify_status("m", StatusCode::BAD_REQUEST, "").is_retryable());
    }

    #[test]
    fn test_rpc_error_classification() {
        let busy: GatewayResponse =
            serde_json::from_value(json!({"error": {"code": -32005, "message": "busy"}})).unwrap();
        assert!(unwrap_response("m", busy).unwrap_err().is_retryable());

        let revert: GatewayResponse =
            serde_json::from_value(json!({"error": {"code": 3, "message": "execution reverted"}}))
                .unwrap();
        assert!(matches!(
            unwrap_response("m", revert),
            Err(SyncError::Decode(_))
        ));

        let pending: GatewayResponse = serde_json::from_value(json!({"result": null})).unwrap();
        assert_eq!(unwrap_response("m", pending).unwrap(), Value::Null);
    }

    #[test]
    fn test_receipt_decodes() {
        let receipt: TxReceipt =
            decode_record(json!({"hash": "0xabc", "status": "failed"})).unwrap();
        assert!(!receipt.is_confirmed());
    }
}
