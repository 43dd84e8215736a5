use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use common::{
    AccountState, Bar, CancelOutcome, Error, ExchangeClient, FillEvent, Order, OrderSide,
    OrderType, RemoteOrder, Result, SubmitOutcome,
};

const QUOTE_ASSET: &str = "USDT";
const RECV_WINDOW_MS: u64 = 5000;

/// Binance error codes for a bad key, a bad signature or a key without
/// permission for the call.
const AUTH_ERROR_CODES: [i64; 3] = [-2014, -2015, -1022];
const UNKNOWN_ORDER: i64 = -2011;
const DUPLICATE_ORDER_MSG: &str = "Duplicate order sent";

/// REST client for Binance spot. Market data, order placement and the
/// account view used for reconciliation.
///
/// Fills are discovered by polling each tracked order's status and its trade
/// list; every trade becomes one [`FillEvent`] numbered by its position in the
/// order's trade list, so numbering survives restarts.
pub struct BinanceClient {
    api_key: String,
    secret: String,
    base_url: String,
    /// Symbols reconciled against account balances.
    symbols: Vec<String>,
    http: Client,
    tracked: Mutex<BTreeMap<String, TrackedOrder>>,
}

#[derive(Debug, Clone)]
struct TrackedOrder {
    symbol: String,
    exchange_order_id: Option<String>,
    /// Trades already reported as fills.
    reported: u64,
    reported_qty: Decimal,
}

impl BinanceClient {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
        symbols: Vec<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            symbols,
            http,
            tracked: Mutex::new(BTreeMap::new()),
        })
    }

    /// Client for public market data only, as used by paper trading.
    pub fn public(base_url: impl Into<String>) -> Result<Self> {
        Self::new("", "", base_url, Vec::new())
    }

    fn sign(&self, query: &str) -> Result<String> {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| Error::Authentication(e.to_string()))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn public_get(&self, path: &str, params: &str) -> Result<String> {
        let url = format!("{}{path}?{params}", self.base_url);
        let resp = self.http.get(&url).send().await.map_err(network_error)?;
        read_body(resp).await
    }

    async fn signed(&self, method: Method, path: &str, params: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(Error::Authentication("no Binance API key configured".into()));
        }
        let ts = Utc::now().timestamp_millis();
        let query = if params.is_empty() {
            format!("recvWindow={RECV_WINDOW_MS}&timestamp={ts}")
        } else {
            format!("{params}&recvWindow={RECV_WINDOW_MS}&timestamp={ts}")
        };
        let signed = format!("{query}&signature={}", self.sign(&query)?);

        let request = if method == Method::POST {
            self.http
                .post(format!("{}{path}", self.base_url))
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(signed)
        } else {
            self.http
                .request(method, format!("{}{path}?{signed}", self.base_url))
        };
        let resp = request
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(network_error)?;
        read_body(resp).await
    }

    async fn query_order(&self, symbol: &str, client_order_id: &str) -> Result<OrderStatusResponse> {
        let body = self
            .signed(
                Method::GET,
                "/api/v3/order",
                &format!("symbol={symbol}&origClientOrderId={client_order_id}"),
            )
            .await?;
        decode(&body)
    }

    async fn track(&self, order: &Order, exchange_order_id: Option<String>) {
        self.tracked.lock().await.insert(
            order.id.clone(),
            TrackedOrder {
                symbol: order.symbol.clone(),
                exchange_order_id,
                reported: order.last_fill_seq,
                reported_qty: order.filled_quantity,
            },
        );
    }

    /// New fills for one order, plus its tracking state afterwards. `None`
    /// state means the order is done and fully reported.
    async fn poll_order(
        &self,
        client_order_id: &str,
        tracked: &TrackedOrder,
    ) -> Result<(Vec<FillEvent>, Option<TrackedOrder>)> {
        let status = self.query_order(&tracked.symbol, client_order_id).await?;
        let executed = parse_decimal(&status.executed_qty)?;
        let mut next = tracked.clone();
        next.exchange_order_id = Some(status.order_id.to_string());

        let mut fills = Vec::new();
        if executed > tracked.reported_qty {
            let body = self
                .signed(
                    Method::GET,
                    "/api/v3/myTrades",
                    &format!("symbol={}&orderId={}", tracked.symbol, status.order_id),
                )
                .await?;
            let mut trades: Vec<TradeResponse> = decode(&body)?;
            trades.sort_by_key(|t| t.id);
            for (i, trade) in trades.iter().enumerate().skip(tracked.reported as usize) {
                let fill = trade_to_fill(client_order_id, &tracked.symbol, i as u64 + 1, trade)?;
                next.reported = fill.fill_seq;
                next.reported_qty += fill.quantity;
                fills.push(fill);
            }
        }

        if is_final_status(&status.status) && next.reported_qty >= executed {
            debug!(
                order_id = client_order_id,
                exchange_order_id = ?next.exchange_order_id,
                status = %status.status,
                "Order no longer tracked"
            );
            return Ok((fills, None));
        }
        Ok((fills, Some(next)))
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    async fn fetch_bars(&self, symbol: &str, interval: &str, lookback: usize) -> Result<Vec<Bar>> {
        // one extra: the newest kline is usually still open
        let limit = (lookback + 1).min(1000);
        let body = self
            .public_get(
                "/api/v3/klines",
                &format!("symbol={symbol}&interval={interval}&limit={limit}"),
            )
            .await?;
        let rows: Vec<Vec<Value>> = decode(&body)?;
        let mut bars = parse_klines(symbol, &rows, Utc::now().timestamp_millis())?;
        if bars.len() > lookback {
            bars.drain(..bars.len() - lookback);
        }
        Ok(bars)
    }

    async fn submit_order(&self, order: &Order) -> Result<SubmitOutcome> {
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}&newClientOrderId={}",
            order.symbol,
            order.side,
            match order.order_type {
                OrderType::Market => "MARKET",
                OrderType::Limit => "LIMIT",
            },
            order.quantity.normalize(),
            order.id
        );
        if let (OrderType::Limit, Some(price)) = (order.order_type, order.limit_price) {
            params.push_str(&format!("&price={}&timeInForce=GTC", price.normalize()));
        }

        debug!(order_id = %order.id, symbol = %order.symbol, side = %order.side, "Submitting order to Binance");
        match self.signed(Method::POST, "/api/v3/order", &params).await {
            Ok(body) => {
                let resp: OrderAck = decode(&body)?;
                let exchange_order_id = resp.order_id.to_string();
                self.track(order, Some(exchange_order_id.clone())).await;
                Ok(SubmitOutcome::Accepted { exchange_order_id })
            }
            // a retried submission whose first attempt did reach the venue
            Err(Error::ExchangeRejection(reason)) if reason.contains(DUPLICATE_ORDER_MSG) => {
                let existing = self.query_order(&order.symbol, &order.id).await?;
                let exchange_order_id = existing.order_id.to_string();
                info!(order_id = %order.id, %exchange_order_id, "Order already on the exchange");
                self.track(order, Some(exchange_order_id.clone())).await;
                Ok(SubmitOutcome::Accepted { exchange_order_id })
            }
            Err(Error::ExchangeRejection(reason)) => Ok(SubmitOutcome::Rejected { reason }),
            Err(e) => Err(e),
        }
    }

    async fn cancel_order(&self, order: &Order) -> Result<CancelOutcome> {
        let params = format!("symbol={}&origClientOrderId={}", order.symbol, order.id);
        match self.signed(Method::DELETE, "/api/v3/order", &params).await {
            Ok(_) => Ok(CancelOutcome::Canceled),
            Err(Error::ExchangeRejection(reason)) if error_code(&reason) == Some(UNKNOWN_ORDER) => {
                Ok(CancelOutcome::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    async fn poll_fills(&self) -> Result<Vec<FillEvent>> {
        let snapshot = self.tracked.lock().await.clone();
        let mut fills = Vec::new();
        let mut updated = BTreeMap::new();
        for (id, tracked) in &snapshot {
            let (mut new_fills, next) = self.poll_order(id, tracked).await?;
            fills.append(&mut new_fills);
            updated.insert(id.clone(), next);
        }

        // commit only once every order polled cleanly, so a failed poll is
        // repeated in full instead of losing fills
        let mut guard = self.tracked.lock().await;
        for (id, next) in updated {
            match next {
                Some(next) => {
                    guard.insert(id, next);
                }
                None => {
                    guard.remove(&id);
                }
            }
        }
        Ok(fills)
    }

    async fn account_state(&self) -> Result<AccountState> {
        let account: AccountResponse =
            decode(&self.signed(Method::GET, "/api/v3/account", "").await?)?;
        let open: Vec<OpenOrderResponse> =
            decode(&self.signed(Method::GET, "/api/v3/openOrders", "").await?)?;

        let mut balances = BTreeMap::new();
        for b in account.balances {
            let total = parse_decimal(&b.free)? + parse_decimal(&b.locked)?;
            if !total.is_zero() {
                balances.insert(b.asset, total);
            }
        }

        let cash_balance = balances.get(QUOTE_ASSET).copied().unwrap_or(Decimal::ZERO);
        let positions = self
            .symbols
            .iter()
            .filter_map(|symbol| {
                let base = symbol.strip_suffix(QUOTE_ASSET)?;
                balances.get(base).map(|qty| (symbol.clone(), *qty))
            })
            .collect();

        let open_orders = open
            .into_iter()
            .map(|o| {
                Ok(RemoteOrder {
                    client_order_id: o.client_order_id,
                    exchange_order_id: Some(o.order_id.to_string()),
                    symbol: o.symbol,
                    side: parse_side(&o.side)?,
                    quantity: parse_decimal(&o.orig_qty)?,
                    filled_quantity: parse_decimal(&o.executed_qty)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(AccountState {
            cash_balance,
            positions,
            open_orders,
        })
    }

    async fn resume_tracking(&self, orders: &[Order]) -> Result<()> {
        for order in orders {
            self.track(order, order.exchange_order_id.clone()).await;
        }
        if !orders.is_empty() {
            info!(count = orders.len(), "Resumed fill tracking for open orders");
        }
        Ok(())
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn network_error(e: reqwest::Error) -> Error {
    Error::ExchangeTransient(format!("network: {e}"))
}

async fn read_body(resp: reqwest::Response) -> Result<String> {
    let status = resp.status();
    let body = resp.text().await.map_err(network_error)?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(classify(status, &body))
    }
}

/// 429/418/5xx are transient, key and signature problems are authentication
/// failures, and any other refusal is a venue rejection.
fn classify(status: StatusCode, body: &str) -> Error {
    let detail = format!("HTTP {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 || status.is_server_error() {
        return Error::ExchangeTransient(detail);
    }
    if status == StatusCode::UNAUTHORIZED
        || error_code(body).is_some_and(|c| AUTH_ERROR_CODES.contains(&c))
    {
        return Error::Authentication(detail);
    }
    Error::ExchangeRejection(detail)
}

/// The `code` of a Binance error payload, wherever it appears in `text`.
fn error_code(text: &str) -> Option<i64> {
    let start = text.find('{')?;
    serde_json::from_str::<ApiError>(&text[start..]).ok().map(|e| e.code)
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| Error::Http(format!("unexpected Binance response: {e}")))
}

fn parse_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| Error::Http(format!("bad decimal '{raw}': {e}")))
}

fn parse_side(raw: &str) -> Result<OrderSide> {
    match raw {
        "BUY" => Ok(OrderSide::Buy),
        "SELL" => Ok(OrderSide::Sell),
        other => Err(Error::Http(format!("unknown side '{other}'"))),
    }
}

fn millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::Http(format!("bad timestamp {ms}")))
}

fn is_final_status(status: &str) -> bool {
    matches!(
        status,
        "FILLED" | "CANCELED" | "REJECTED" | "EXPIRED" | "EXPIRED_IN_MATCH"
    )
}

/// Klines whose close time has passed, oldest first.
fn parse_klines(symbol: &str, rows: &[Vec<Value>], now_ms: i64) -> Result<Vec<Bar>> {
    let field = |row: &[Value], i: usize| -> Result<f64> {
        row.get(i)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Http(format!("kline field {i} missing or not numeric")))
    };
    let time = |row: &[Value], i: usize| -> Result<i64> {
        row.get(i)
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Http(format!("kline time field {i} missing")))
    };

    let mut bars = Vec::with_capacity(rows.len());
    for row in rows {
        if time(row, 6)? >= now_ms {
            continue;
        }
        bars.push(Bar {
            symbol: symbol.to_string(),
            timestamp: millis(time(row, 0)?)?,
            open: field(row, 1)?,
            high: field(row, 2)?,
            low: field(row, 3)?,
            close: field(row, 4)?,
            volume: field(row, 5)?,
        });
    }
    Ok(bars)
}

/// Commission is converted to the quote asset when charged in the base
/// asset. Third-asset commissions (BNB) are not cash and count as zero.
fn trade_to_fill(order_id: &str, symbol: &str, fill_seq: u64, trade: &TradeResponse) -> Result<FillEvent> {
    let price = parse_decimal(&trade.price)?;
    let quantity = parse_decimal(&trade.qty)?;
    let commission = parse_decimal(&trade.commission)?;
    let fee = if trade.commission_asset == QUOTE_ASSET {
        commission
    } else if symbol.strip_suffix(QUOTE_ASSET) == Some(trade.commission_asset.as_str()) {
        commission * price
    } else {
        if !commission.is_zero() {
            warn!(symbol, asset = %trade.commission_asset, "Commission in third asset not deducted from cash");
        }
        Decimal::ZERO
    };
    Ok(FillEvent {
        order_id: order_id.to_string(),
        exchange_order_id: Some(trade.order_id.to_string()),
        fill_seq,
        quantity,
        price,
        fee,
        timestamp: millis(trade.time)?,
    })
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ApiError {
    code: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderAck {
    order_id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderStatusResponse {
    order_id: u64,
    status: String,
    executed_qty: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradeResponse {
    id: u64,
    order_id: u64,
    price: String,
    qty: String,
    commission: String,
    commission_asset: String,
    time: i64,
}

#[derive(Deserialize)]
struct AccountResponse {
    balances: Vec<Balance>,
}

#[derive(Deserialize)]
struct Balance {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenOrderResponse {
    symbol: String,
    order_id: u64,
    client_order_id: String,
    side: String,
    orig_qty: String,
    executed_qty: String,
}
