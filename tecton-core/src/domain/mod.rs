//! Domain types for the futures data layer

pub mod calendar;
pub mod chain;
pub mod contract;
pub mod ids;
pub mod market;
pub mod month;

pub use calendar::{ExchangeCalendar, TradingDays};
pub use chain::{ChainBuild, ChainError, ContractChain, SkipReason, SkippedContract};
pub use contract::{Contract, ContractBar, ContractMetadata};
pub use ids::{CalendarId, ContractId, MarketId};
pub use market::{CurrencyPeriod, ExpiryRule, MarketDefinition, MarketError, MultiplierChange};
pub use month::{month_code, month_from_code, ContractCycle, MonthError, YearMonth};
