mod order;
mod signal;
mod tenant;

pub use order::{NewOrder, OrderRecord, OrderStatus};
pub use signal::{OrderType, Side, SignalAction, TradeSignal};
pub use tenant::{
    CredentialCipher, Credentials, DcaParams, ExchangeId, PreferredSide, SignalParams,
    StrategyConfig, TenantConfig,
};
