//! Data models for bars, instruments, deal directions, and session accounting.

mod bar;
mod direction;
mod instrument;
mod session;

pub use bar::{Bar, Quote};
pub use direction::Direction;
pub use instrument::{InstrumentMetadata, MarginBand, UnitKind};
pub use session::SessionTotals;
