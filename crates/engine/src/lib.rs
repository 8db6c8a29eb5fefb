pub mod dca;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod sizing;

pub use dca::{DcaEngine, DcaRunReport};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use error::EngineError;
pub use lifecycle::{ExecutedOrder, OrderExecutor};
