pub mod config;
pub mod entry;
pub mod manager;
pub mod sessions;
pub mod sizing;
pub mod strategy;

pub use config::TradingConfig;
pub use entry::{EntryDecision, EntryGate};
pub use manager::{CloseReason, OpenPosition, StopUpdate, TickDecision, TradeManager, TrailingParams};
pub use sessions::{SessionConfig, SessionWindow};
pub use sizing::{SizingCalculator, SizingResult};
pub use strategy::{DirectionStrategy, SignalKind, StrategyConfig};
