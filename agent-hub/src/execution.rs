//! Order execution client interface and an in-memory paper implementation

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

use common::{Account, Order, OrderSide, OrderStatus, OrderType, Position, Symbol, Utc};

use crate::error::ProviderError;

/// Broker-facing operations available to agents through their context
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    async fn submit_market_order(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
    ) -> Result<Order, ProviderError>;

    async fn submit_limit_order(
        &self,
        symbol: &str,
        price: f64,
        qty: f64,
        side: OrderSide,
    ) -> Result<Order, ProviderError>;

    async fn cancel_order(&self, id: Uuid) -> Result<Order, ProviderError>;

    async fn get_all_positions(&self) -> Result<Vec<Position>, ProviderError>;

    async fn get_account(&self) -> Result<Account, ProviderError>;

    async fn get_all_orders(&self) -> Result<Vec<Order>, ProviderError>;
}

#[derive(Debug, Clone, Copy, Default)]
struct Holding {
    qty: f64,
    avg_entry_price: f64,
}

impl Holding {
    /// Apply a fill of signed quantity `delta` at `price`
    fn apply(&mut self, delta: f64, price: f64) {
        let new_qty = self.qty + delta;
        if self.qty == 0.0 || self.qty.signum() == delta.signum() {
            // opening or adding
            self.avg_entry_price =
                (self.avg_entry_price * self.qty.abs() + price * delta.abs()) / new_qty.abs();
        } else if new_qty != 0.0 && new_qty.signum() != self.qty.signum() {
            // flipped through zero
            self.avg_entry_price = price;
        }
        self.qty = new_qty;
    }
}

#[derive(Debug)]
struct PaperBook {
    cash: f64,
    marks: HashMap<Symbol, f64>,
    holdings: BTreeMap<Symbol, Holding>,
    orders: Vec<Order>,
    injected_failures: VecDeque<ProviderError>,
}

impl PaperBook {
    fn fill(&mut self, index: usize, price: f64) {
        let order = &mut self.orders[index];
        order.status = OrderStatus::Filled;
        order.filled_qty = order.qty;
        order.filled_avg_price = Some(price);

        let delta = order.side.sign() * order.qty;
        let symbol = order.symbol.clone();
        info!(order_id = %order.id, symbol = %symbol, side = %order.side, qty = order.qty, price, "Paper order filled");

        self.cash -= delta * price;
        let holding = self.holdings.entry(symbol.clone()).or_default();
        holding.apply(delta, price);
        if holding.qty == 0.0 {
            self.holdings.remove(&symbol);
        }
    }

    fn is_marketable(order: &Order, mark: f64) -> bool {
        match (order.order_type, order.side) {
            (OrderType::Market, _) => true,
            (OrderType::Limit { price }, OrderSide::Buy) => mark <= price,
            (OrderType::Limit { price }, OrderSide::Sell) => mark >= price,
        }
    }

    /// Quantity committed to open orders that would reduce the holding
    fn reserved(&self, symbol: &str, holding: &Holding) -> f64 {
        self.orders
            .iter()
            .filter(|o| o.symbol == symbol && o.status.is_open())
            .filter(|o| o.side.sign() != holding.qty.signum())
            .map(|o| o.qty)
            .sum()
    }

    fn position(&self, symbol: &str, holding: &Holding) -> Position {
        let current_price = self
            .marks
            .get(symbol)
            .copied()
            .unwrap_or(holding.avg_entry_price);
        let available = (holding.qty.abs() - self.reserved(symbol, holding)).max(0.0);

        Position {
            symbol: symbol.to_string(),
            qty: holding.qty,
            qty_available: available * holding.qty.signum(),
            avg_entry_price: holding.avg_entry_price,
            current_price,
            market_value: holding.qty * current_price,
        }
    }

    fn take_failure(&mut self) -> Result<(), ProviderError> {
        match self.injected_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// In-memory execution client.
///
/// Market orders fill immediately at the symbol's mark price. Limit orders fill at the
/// mark when marketable and otherwise rest until a later mark crosses them or they are
/// cancelled.
#[derive(Debug)]
pub struct PaperExecutionClient {
    book: Mutex<PaperBook>,
}

impl PaperExecutionClient {
    pub fn new(starting_cash: f64) -> Self {
        Self {
            book: Mutex::new(PaperBook {
                cash: starting_cash,
                marks: HashMap::new(),
                holdings: BTreeMap::new(),
                orders: Vec::new(),
                injected_failures: VecDeque::new(),
            }),
        }
    }

    /// Update the mark price for `symbol` and fill any resting limit orders it crosses
    pub fn set_mark(&self, symbol: &str, price: f64) {
        let mut book = self.book.lock();
        book.marks.insert(symbol.to_string(), price);

        let crossed: Vec<usize> = book
            .orders
            .iter()
            .enumerate()
            .filter(|(_, o)| o.symbol == symbol && o.status.is_open())
            .filter(|(_, o)| PaperBook::is_marketable(o, price))
            .map(|(i, _)| i)
            .collect();

        for index in crossed {
            book.fill(index, price);
        }
    }

    pub fn mark(&self, symbol: &str) -> Option<f64> {
        self.book.lock().marks.get(symbol).copied()
    }

    /// Fail the next request with `error`
    pub fn inject_failure(&self, error: ProviderError) {
        self.book.lock().injected_failures.push_back(error);
    }

    fn submit(&self, symbol: &str, qty: f64, side: OrderSide, order_type: OrderType) -> Result<Order, ProviderError> {
        if !qty.is_finite() || qty <= 0.0 {
            return Err(ProviderError::Rejected(format!("invalid quantity {}", qty)));
        }
        if let OrderType::Limit { price } = order_type {
            if !price.is_finite() || price <= 0.0 {
                return Err(ProviderError::Rejected(format!("invalid limit price {}", price)));
            }
        }

        let mut book = self.book.lock();
        book.take_failure()?;

        let mark = book.marks.get(symbol).copied();
        if order_type == OrderType::Market && mark.is_none() {
            return Err(ProviderError::Rejected(format!("no market price for {}", symbol)));
        }

        let order = Order {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            order_type,
            qty,
            filled_qty: 0.0,
            filled_avg_price: None,
            status: OrderStatus::New,
            created_at: Utc::now(),
        };
        debug!(order_id = %order.id, symbol, %side, qty, ?order_type, "Paper order accepted");

        book.orders.push(order);
        let index = book.orders.len() - 1;
        if let Some(mark) = mark {
            if PaperBook::is_marketable(&book.orders[index], mark) {
                book.fill(index, mark);
            }
        }

        Ok(book.orders[index].clone())
    }
}

impl Default for PaperExecutionClient {
    fn default() -> Self {
        Self::new(100_000.0)
    }
}

#[async_trait]
impl ExecutionClient for PaperExecutionClient {
    async fn submit_market_order(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
    ) -> Result<Order, ProviderError> {
        self.submit(symbol, qty, side, OrderType::Market)
    }

    async fn submit_limit_order(
        &self,
        symbol: &str,
        price: f64,
        qty: f64,
        side: OrderSide,
    ) -> Result<Order, ProviderError> {
        self.submit(symbol, qty, side, OrderType::Limit { price })
    }

    async fn cancel_order(&self, id: Uuid) -> Result<Order, ProviderError> {
        let mut book = self.book.lock();
        book.take_failure()?;

        let order = book
            .orders
            .iter_mut()
            .find(|o| o.id == id)
            .ok_or_else(|| ProviderError::NotFound(format!("order {}", id)))?;

        if !order.status.is_open() {
            return Err(ProviderError::Rejected(format!(
                "order {} is {:?} and cannot be cancelled",
                id, order.status
            )));
        }

        order.status = OrderStatus::Canceled;
        Ok(order.clone())
    }

    async fn get_all_positions(&self) -> Result<Vec<Position>, ProviderError> {
        let mut book = self.book.lock();
        book.take_failure()?;

        Ok(book
            .holdings
            .iter()
            .map(|(symbol, holding)| book.position(symbol, holding))
            .collect())
    }

    async fn get_account(&self) -> Result<Account, ProviderError> {
        let mut book = self.book.lock();
        book.take_failure()?;

        let market_value: f64 = book
            .holdings
            .iter()
            .map(|(symbol, holding)| book.position(symbol, holding).market_value)
            .sum();

        Ok(Account {
            cash: book.cash,
            equity: book.cash + market_value,
            buying_power: book.cash.max(0.0),
        })
    }

    async fn get_all_orders(&self) -> Result<Vec<Order>, ProviderError> {
        let mut book = self.book.lock();
        book.take_failure()?;
        Ok(book.orders.clone())
    }
}
