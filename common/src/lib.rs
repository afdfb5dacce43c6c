//! Shared market and order types used by the hub, its collaborators and the built-in agents.

pub mod market;
pub mod orders;

pub use market::{
    spot_price_topic, spread_topic, FairPriceMethod, Quote, SpotPrice, Spread, Symbol, Tick, Trade,
};
pub use orders::{Account, Order, OrderSide, OrderStatus, OrderType, Position};

pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
