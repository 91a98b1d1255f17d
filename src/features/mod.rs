pub mod engineering;
pub mod indicators;
pub mod selection;

pub use engineering::{create_moving_average_features, create_technical_features};
pub use selection::preprocess_features;
