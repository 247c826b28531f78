use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::types::{Candle, OrderSide, TimeFrame};

use super::{
    Broker, BrokerOrder, BrokerOrderStatus, ExecutionReport, FuturesPosition, OrderFill,
    SymbolInfo,
};

const BINANCE_FUTURES_API: &str = "https://fapi.binance.com";
const RECV_WINDOW_MS: u64 = 5000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

type HmacSha256 = Hmac<Sha256>;

/// USDⓈ-M futures REST adapter. The only module that speaks HTTP to the
/// exchange.
#[derive(Debug, Clone)]
pub struct BinanceFuturesClient {
    client: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
}

impl BinanceFuturesClient {
    pub fn new(api_key: String, secret_key: String) -> Self {
        Self::with_base_url(api_key, secret_key, BINANCE_FUTURES_API.to_string())
    }

    pub fn with_base_url(api_key: String, secret_key: String, base_url: String) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            client,
            api_key,
            secret_key,
            base_url,
        }
    }

    /// Unauthenticated client for market data only.
    pub fn public_only() -> Self {
        Self::new(String::new(), String::new())
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC accepts keys of any size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let mut parts: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        parts.push(format!("timestamp={}", Utc::now().timestamp_millis()));
        parts.push(format!("recvWindow={RECV_WINDOW_MS}"));
        let query = parts.join("&");
        let signature = self.sign(&query);
        format!("{query}&signature={signature}")
    }

    async fn signed_post(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params));
        let response = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("binance request failed")?;
        Self::parse_response(response).await
    }

    async fn signed_get(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params));
        let response = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("binance request failed")?;
        Self::parse_response(response).await
    }

    async fn signed_delete(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params));
        let response = self
            .client
            .delete(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("binance request failed")?;
        Self::parse_response(response).await
    }

    async fn parse_response(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.context("decoding binance response")?;
        if !status.is_success() {
            let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
            let msg = body
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(anyhow!("binance error {status}: code={code} msg={msg}"));
        }
        Ok(body)
    }

    fn parse_decimal(value: &Value, field: &str) -> Result<Decimal> {
        let raw = value
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing field '{field}'"))?;
        Decimal::from_str(raw).with_context(|| format!("parsing decimal field '{field}'"))
    }

    fn parse_status(value: &Value) -> Result<BrokerOrderStatus> {
        let raw = value
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing order status"))?;
        Ok(match raw {
            "NEW" => BrokerOrderStatus::New,
            "PARTIALLY_FILLED" => BrokerOrderStatus::PartiallyFilled,
            "FILLED" => BrokerOrderStatus::Filled,
            "CANCELED" => BrokerOrderStatus::Canceled,
            "REJECTED" => BrokerOrderStatus::Rejected,
            "EXPIRED" | "EXPIRED_IN_MATCH" => BrokerOrderStatus::Expired,
            other => return Err(anyhow!("unknown order status '{other}'")),
        })
    }

    fn order_from_value(value: &Value) -> Result<BrokerOrder> {
        let order_id = value
            .get("orderId")
            .map(|v| v.to_string().trim_matches('"').to_string())
            .ok_or_else(|| anyhow!("missing orderId"))?;
        let status = Self::parse_status(value)?;
        let executed_qty = Self::parse_decimal(value, "executedQty").unwrap_or(Decimal::ZERO);
        let avg_price = Self::parse_decimal(value, "avgPrice").unwrap_or(Decimal::ZERO);

        // Futures order queries report an average price instead of
        // per-trade fills; synthesize a single fill from it.
        let fills = if executed_qty > Decimal::ZERO && avg_price > Decimal::ZERO {
            vec![OrderFill {
                price: avg_price,
                qty: executed_qty,
                commission: Decimal::ZERO,
            }]
        } else {
            Vec::new()
        };

        Ok(BrokerOrder {
            order_id,
            status,
            executed_qty,
            fills,
        })
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        params_extra: &[(&str, String)],
    ) -> Result<ExecutionReport> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("newOrderRespType", "RESULT".to_string()),
            ("newClientOrderId", new_client_order_id()),
        ];
        params.extend_from_slice(params_extra);

        let body = self.signed_post("/fapi/v1/order", &params).await?;
        let order = Self::order_from_value(&body)?;
        debug!(%symbol, order_id = %order.order_id, "market order placed");
        Ok(ExecutionReport {
            avg_price: order.average_fill_price().unwrap_or(Decimal::ZERO),
            executed_qty: order.executed_qty,
            order_id: order.order_id,
        })
    }

    async fn place_trigger_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        trigger_price: Decimal,
        order_type: &str,
    ) -> Result<String> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", order_type.to_string()),
            ("quantity", qty.to_string()),
            ("stopPrice", trigger_price.to_string()),
            ("reduceOnly", "true".to_string()),
            ("newClientOrderId", new_client_order_id()),
        ];
        let body = self.signed_post("/fapi/v1/order", &params).await?;
        let order_id = body
            .get("orderId")
            .map(|v| v.to_string().trim_matches('"').to_string())
            .ok_or_else(|| anyhow!("missing orderId in trigger order response"))?;
        debug!(%symbol, %order_id, order_type, "trigger order placed");
        Ok(order_id)
    }
}

#[async_trait]
impl Broker for BinanceFuturesClient {
    async fn get_klines(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            timeframe.as_str(),
            limit
        );
        let rows: Vec<Vec<Value>> = self
            .client
            .get(&url)
            .send()
            .await
            .context("fetching klines")?
            .json()
            .await
            .context("decoding klines")?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() < 7 {
                return Err(anyhow!("malformed kline row"));
            }
            let ms = |v: &Value| -> Result<i64> {
                v.as_i64().ok_or_else(|| anyhow!("bad kline timestamp"))
            };
            let dec = |v: &Value| -> Result<Decimal> {
                let raw = v.as_str().ok_or_else(|| anyhow!("bad kline number"))?;
                Decimal::from_str(raw).context("parsing kline decimal")
            };
            candles.push(Candle {
                open_time: Utc
                    .timestamp_millis_opt(ms(&row[0])?)
                    .single()
                    .ok_or_else(|| anyhow!("bad kline open time"))?,
                open: dec(&row[1])?,
                high: dec(&row[2])?,
                low: dec(&row[3])?,
                close: dec(&row[4])?,
                volume: dec(&row[5])?,
                close_time: Utc
                    .timestamp_millis_opt(ms(&row[6])?)
                    .single()
                    .ok_or_else(|| anyhow!("bad kline close time"))?,
            });
        }
        candles.sort_by_key(|c| c.open_time);
        Ok(candles)
    }

    async fn market_buy(&self, symbol: &str, quote_usdt: Decimal) -> Result<ExecutionReport> {
        // Futures has no quote-quantity market orders; derive quantity
        // from the latest mark price.
        let url = format!(
            "{}/fapi/v1/ticker/price?symbol={}",
            self.base_url, symbol
        );
        let ticker: Value = self
            .client
            .get(&url)
            .send()
            .await
            .context("fetching ticker")?
            .json()
            .await
            .context("decoding ticker")?;
        let price = Self::parse_decimal(&ticker, "price")?;
        if price.is_zero() {
            return Err(anyhow!("zero ticker price for {symbol}"));
        }
        let info = self.get_symbol_info(symbol).await?;
        let qty = round_to_step(quote_usdt / price, info.step_size);
        if qty.is_zero() {
            return Err(anyhow!("order size below step for {symbol}"));
        }
        self.market_buy_by_qty(symbol, qty).await
    }

    async fn market_buy_by_qty(&self, symbol: &str, qty: Decimal) -> Result<ExecutionReport> {
        self.place_market_order(symbol, OrderSide::Buy, &[("quantity", qty.to_string())])
            .await
    }

    async fn market_sell(&self, symbol: &str, qty: Decimal) -> Result<ExecutionReport> {
        self.place_market_order(symbol, OrderSide::Sell, &[("quantity", qty.to_string())])
            .await
    }

    async fn place_stop_loss_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        trigger_price: Decimal,
    ) -> Result<String> {
        self.place_trigger_order(symbol, side, qty, trigger_price, "STOP_MARKET")
            .await
    }

    async fn place_take_profit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        trigger_price: Decimal,
    ) -> Result<String> {
        self.place_trigger_order(symbol, side, qty, trigger_price, "TAKE_PROFIT_MARKET")
            .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        self.signed_delete("/fapi/v1/order", &params).await?;
        Ok(())
    }

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<BrokerOrder> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let body = self.signed_get("/fapi/v1/order", &params).await?;
        Self::order_from_value(&body)
    }

    async fn get_usdt_balance(&self) -> Result<Decimal> {
        let body = self.signed_get("/fapi/v2/balance", &[]).await?;
        let rows = body
            .as_array()
            .ok_or_else(|| anyhow!("unexpected balance response"))?;
        for row in rows {
            if row.get("asset").and_then(Value::as_str) == Some("USDT") {
                return Self::parse_decimal(row, "availableBalance");
            }
        }
        Ok(Decimal::ZERO)
    }

    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        let url = format!(
            "{}/fapi/v1/exchangeInfo?symbol={}",
            self.base_url, symbol
        );
        let body: Value = self
            .client
            .get(&url)
            .send()
            .await
            .context("fetching exchange info")?
            .json()
            .await
            .context("decoding exchange info")?;

        let filters = body
            .get("symbols")
            .and_then(Value::as_array)
            .and_then(|symbols| symbols.first())
            .and_then(|s| s.get("filters"))
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("missing filters for {symbol}"))?;

        for filter in filters {
            if filter.get("filterType").and_then(Value::as_str) == Some("LOT_SIZE") {
                return Ok(SymbolInfo {
                    step_size: Self::parse_decimal(filter, "stepSize")?,
                });
            }
        }
        Err(anyhow!("no LOT_SIZE filter for {symbol}"))
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<BrokerOrder>> {
        let params = vec![("symbol", symbol.to_string())];
        let body = self.signed_get("/fapi/v1/openOrders", &params).await?;
        let rows = body
            .as_array()
            .ok_or_else(|| anyhow!("unexpected open orders response"))?;
        rows.iter().map(Self::order_from_value).collect()
    }

    async fn get_futures_positions(&self) -> Result<Vec<FuturesPosition>> {
        let body = self.signed_get("/fapi/v2/positionRisk", &[]).await?;
        let rows = body
            .as_array()
            .ok_or_else(|| anyhow!("unexpected position risk response"))?;
        let mut positions = Vec::new();
        for row in rows {
            let amt = Self::parse_decimal(row, "positionAmt")?;
            if amt.is_zero() {
                continue;
            }
            positions.push(FuturesPosition {
                symbol: row
                    .get("symbol")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                position_amt: amt,
                entry_price: Self::parse_decimal(row, "entryPrice")?,
                unrealized_pnl: Self::parse_decimal(row, "unRealizedProfit")
                    .unwrap_or(Decimal::ZERO),
            });
        }
        Ok(positions)
    }
}

fn new_client_order_id() -> String {
    format!("tt-{}", Uuid::new_v4().simple())
}

/// Round a quantity down to the symbol's lot step.
pub fn round_to_step(qty: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return qty;
    }
    (qty / step).floor() * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn round_to_step_floors() {
        assert_eq!(round_to_step(dec!(0.1234), dec!(0.01)), dec!(0.12));
        assert_eq!(round_to_step(dec!(5), dec!(1)), dec!(5));
        assert_eq!(round_to_step(dec!(0.009), dec!(0.01)), dec!(0.00));
        assert_eq!(round_to_step(dec!(7), Decimal::ZERO), dec!(7));
    }

    #[test]
    fn order_from_value_maps_status_and_fill() {
        let body = json!({
            "orderId": 123456,
            "status": "FILLED",
            "executedQty": "0.5",
            "avgPrice": "42000.10"
        });
        let order = BinanceFuturesClient::order_from_value(&body).unwrap();
        assert_eq!(order.order_id, "123456");
        assert_eq!(order.status, BrokerOrderStatus::Filled);
        assert_eq!(order.executed_qty, dec!(0.5));
        assert_eq!(order.average_fill_price(), Some(dec!(42000.10)));
    }

    #[test]
    fn order_from_value_rejects_unknown_status() {
        let body = json!({
            "orderId": 1,
            "status": "HALTED",
            "executedQty": "0",
            "avgPrice": "0"
        });
        assert!(BinanceFuturesClient::order_from_value(&body).is_err());
    }
}
