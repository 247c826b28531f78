pub mod binance;

pub use binance::*;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Candle, OrderSide, TimeFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl BrokerOrderStatus {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            BrokerOrderStatus::Filled
                | BrokerOrderStatus::Canceled
                | BrokerOrderStatus::Rejected
                | BrokerOrderStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub price: Decimal,
    pub qty: Decimal,
    pub commission: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub order_id: String,
    pub status: BrokerOrderStatus,
    pub executed_qty: Decimal,
    pub fills: Vec<OrderFill>,
}

impl BrokerOrder {
    /// Quantity-weighted average fill price, when any fill exists.
    pub fn average_fill_price(&self) -> Option<Decimal> {
        let total_qty: Decimal = self.fills.iter().map(|f| f.qty).sum();
        if total_qty.is_zero() {
            return None;
        }
        let notional: Decimal = self.fills.iter().map(|f| f.price * f.qty).sum();
        Some(notional / total_qty)
    }
}

/// Immediate result of a market order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub order_id: String,
    pub executed_qty: Decimal,
    pub avg_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub step_size: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuturesPosition {
    pub symbol: String,
    /// Signed: positive long, negative short.
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Narrow interface the executor speaks to an exchange through. Failures
/// surface as errors; the executor maps them to no-ops or retries and
/// never lets them reach the decision layer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_klines(
        &self,
        symbol: &str,
        timeframe: TimeFrame,
        limit: u32,
    ) -> anyhow::Result<Vec<Candle>>;

    /// Market buy spending `quote_usdt` of quote currency.
    async fn market_buy(&self, symbol: &str, quote_usdt: Decimal) -> anyhow::Result<ExecutionReport>;

    async fn market_buy_by_qty(&self, symbol: &str, qty: Decimal)
        -> anyhow::Result<ExecutionReport>;

    async fn market_sell(&self, symbol: &str, qty: Decimal) -> anyhow::Result<ExecutionReport>;

    async fn place_stop_loss_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        trigger_price: Decimal,
    ) -> anyhow::Result<String>;

    async fn place_take_profit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        trigger_price: Decimal,
    ) -> anyhow::Result<String>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> anyhow::Result<()>;

    async fn get_order(&self, symbol: &str, order_id: &str) -> anyhow::Result<BrokerOrder>;

    async fn get_usdt_balance(&self) -> anyhow::Result<Decimal>;

    async fn get_symbol_info(&self, symbol: &str) -> anyhow::Result<SymbolInfo>;

    async fn get_open_orders(&self, symbol: &str) -> anyhow::Result<Vec<BrokerOrder>>;

    async fn get_futures_positions(&self) -> anyhow::Result<Vec<FuturesPosition>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn average_fill_price_weights_by_qty() {
        let order = BrokerOrder {
            order_id: "1".to_string(),
            status: BrokerOrderStatus::Filled,
            executed_qty: dec!(3),
            fills: vec![
                OrderFill {
                    price: dec!(100),
                    qty: dec!(1),
                    commission: dec!(0.1),
                },
                OrderFill {
                    price: dec!(103),
                    qty: dec!(2),
                    commission: dec!(0.2),
                },
            ],
        };
        assert_eq!(order.average_fill_price(), Some(dec!(102)));
    }

    #[test]
    fn empty_fills_have_no_average() {
        let order = BrokerOrder {
            order_id: "1".to_string(),
            status: BrokerOrderStatus::New,
            executed_qty: Decimal::ZERO,
            fills: Vec::new(),
        };
        assert_eq!(order.average_fill_price(), None);
    }
}
