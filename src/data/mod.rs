pub mod client;
pub mod external;
pub mod frame;
pub mod loader;
pub mod paths;

pub use client::MarketDataClient;
pub use external::{enrich_with_external_features, ExternalDataClient};
pub use frame::Frame;
pub use loader::calculate_financial_indicators;
