pub mod forest;
pub mod metrics;
pub mod mlp;
pub mod models;
pub mod training;
pub mod validation;

pub use metrics::RegressionMetrics;
pub use models::{Model, ModelKind, Regressor, SavedModel, TrainingParams};
pub use training::{
    clean_old_models, compare_models, get_best_model_by_mse, refit_on_all,
    train_and_evaluate_model,
};
