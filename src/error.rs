use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Column '{0}' not found")]
    MissingColumn(String),

    #[error("Column '{name}' has {actual} rows, expected {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Download failed for {url}: {message}")]
    DownloadError {
        url: String,
        message: String,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed data: {0}")]
    Malformed(String),
}

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("No usable feature columns: {0}")]
    NoFeatures(String),

    #[error("Feature and target lengths differ: {features} vs {target}")]
    LengthMismatch {
        features: usize,
        target: usize,
    },
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Unsupported model type: {0}")]
    UnsupportedModel(String),

    #[error("Invalid polynomial degree {0}; must be between 2 and 10")]
    InvalidDegree(usize),

    #[error("Model is not fitted")]
    NotFitted,

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Not enough samples: need {needed}, have {available}")]
    InsufficientData {
        needed: usize,
        available: usize,
    },

    #[error("Training failed: {0}")]
    TrainingError(String),

    #[error("Model persistence failed: {0}")]
    PersistenceError(String),
}

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("No models available for {0}")]
    NoModels(String),

    #[error("Preprocessed data unavailable for {0}")]
    MissingData(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Data(#[from] DataError),
}

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Not enough groups for ANOVA: need {needed}, have {available}")]
    NotEnoughGroups {
        needed: usize,
        available: usize,
    },

    #[error("Group '{0}' has fewer than two observations")]
    DegenerateGroup(String),

    #[error("Distribution error: {0}")]
    Distribution(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Data(#[from] DataError),
}
