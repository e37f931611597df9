pub mod candle;
pub mod clock;
pub mod config;
pub mod config_loader;
pub mod error;
pub mod events;
pub mod series;
pub mod timeframe;

pub use candle::{Candle, CandleVersion, VersionedCandle, WriteRequest};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AppConfig, DatabaseConfig, FeedConfig, ReconciliationConfig, StoreBackendKind, StoreConfig,
    SubscriptionConfig, TimestampUnit,
};
pub use config_loader::ConfigLoader;
pub use error::{validate_symbols, ValidationError};
pub use events::ClosedCandle;
pub use series::{SeriesId, Tier};
pub use timeframe::Timeframe;
