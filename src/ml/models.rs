use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use super::forest::RandomForestRegressor;
use super::mlp::MlpRegressor;
use crate::config::TrainingConfig;
use crate::error::ModelError;

pub trait Regressor {
    fn fit(&mut self, x: &DMatrix<f64>, y: &DVector<f64>) -> Result<(), ModelError>;
    fn predict(&self, x: &DMatrix<f64>) -> Result<DVector<f64>, ModelError>;
}

/// Minimum-norm least squares solution of `a * beta = b` through SVD.
/// Singular values below the usual machine-precision cutoff are ignored.
pub fn least_squares(a: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    let (n, p) = a.shape();
    if n == 0 || p == 0 {
        return None;
    }
    let svd = a.clone().svd(true, true);
    let max_sv = svd.singular_values.max();
    let eps = max_sv * (n.max(p) as f64) * f64::EPSILON;
    svd.solve(b, eps).ok()
}

pub(crate) fn check_dimensions(x: &DMatrix<f64>, y: &DVector<f64>) -> Result<(), ModelError> {
    if x.nrows() != y.len() {
        return Err(ModelError::DimensionMismatch(format!(
            "{} feature rows vs {} targets",
            x.nrows(),
            y.len()
        )));
    }
    if x.nrows() == 0 {
        return Err(ModelError::InsufficientData {
            needed: 1,
            available: 0,
        });
    }
    if x.ncols() == 0 {
        return Err(ModelError::DimensionMismatch("no feature columns".to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    Mlp,
    Linear,
    Polynomial,
    RandomForest,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Mlp,
        ModelKind::Linear,
        ModelKind::Polynomial,
        ModelKind::RandomForest,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Mlp => "MLP",
            ModelKind::Linear => "Linear",
            ModelKind::Polynomial => "Polynomial",
            ModelKind::RandomForest => "RandomForest",
        }
    }

    /// Prefix of the persisted model file.
    pub fn file_prefix(&self) -> String {
        self.name().to_lowercase()
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['_', '-'], "").as_str() {
            "mlp" => Ok(ModelKind::Mlp),
            "linear" => Ok(ModelKind::Linear),
            "polynomial" => Ok(ModelKind::Polynomial),
            "randomforest" => Ok(ModelKind::RandomForest),
            _ => Err(ModelError::UnsupportedModel(s.to_string())),
        }
    }
}

/// Hyper-parameters shared by every model family.
#[derive(Debug, Clone)]
pub struct TrainingParams {
    pub kfolds: usize,
    pub poly_degree: usize,
    pub n_estimators: usize,
    pub validation_split: f64,
    pub random_state: u64,
}

impl From<&TrainingConfig> for TrainingParams {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            kfolds: config.kfolds,
            poly_degree: config.poly_degree,
            n_estimators: config.n_estimators,
            validation_split: config.validation_split,
            random_state: config.random_state,
        }
    }
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self::from(&TrainingConfig::default())
    }
}

/// Ordinary least squares with an intercept, fitted on centred data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinearRegression {
    pub intercept: f64,
    pub coefficients: Option<DVector<f64>>,
}

impl LinearRegression {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Regressor for LinearRegression {
    fn fit(&mut self, x: &DMatrix<f64>, y: &DVector<f64>) -> Result<(), ModelError> {
        check_dimensions(x, y)?;
        let x_mean = x.row_mean();
        let y_mean = y.mean();

        let mut centered = x.clone();
        for mut row in centered.row_iter_mut() {
            row -= &x_mean;
        }
        let y_centered = y.add_scalar(-y_mean);

        let coefficients = least_squares(&centered, &y_centered)
            .ok_or_else(|| ModelError::TrainingError("least squares did not converge".to_string()))?;
        self.intercept = y_mean - x_mean.transpose().dot(&coefficients);
        self.coefficients = Some(coefficients);
        Ok(())
    }

    fn predict(&self, x: &DMatrix<f64>) -> Result<DVector<f64>, ModelError> {
        let coefficients = self.coefficients.as_ref().ok_or(ModelError::NotFitted)?;
        if x.ncols() != coefficients.len() {
            return Err(ModelError::DimensionMismatch(format!(
                "model expects {} features, got {}",
                coefficients.len(),
                x.ncols()
            )));
        }
        Ok((x * coefficients).add_scalar(self.intercept))
    }
}

/// Interaction-only polynomial expansion followed by OLS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolynomialRegression {
    pub degree: usize,
    terms: Vec<Vec<usize>>,
    linear: LinearRegression,
}

fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    let mut current = Vec::with_capacity(k);
    fn recurse(start: usize, n: usize, k: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if current.len() == k {
            out.push(current.clone());
            return;
        }
        for i in start..n {
            current.push(i);
            recurse(i + 1, n, k, current, out);
            current.pop();
        }
    }
    recurse(0, n, k, &mut current, &mut out);
    out
}

/// Bias term, then every product of 1..=degree distinct features in
/// lexicographic order.
pub fn interaction_terms(n_features: usize, degree: usize) -> Vec<Vec<usize>> {
    let mut terms = vec![Vec::new()];
    for d in 1..=degree.min(n_features) {
        terms.extend(combinations(n_features, d));
    }
    terms
}

impl PolynomialRegression {
    pub fn new(degree: usize) -> Result<Self, ModelError> {
        if !(2..=10).contains(&degree) {
            return Err(ModelError::InvalidDegree(degree));
        }
        Ok(Self {
            degree,
            terms: Vec::new(),
            linear: LinearRegression::new(),
        })
    }

    fn expand(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(x.nrows(), self.terms.len(), |r, c| {
            self.terms[c].iter().map(|&j| x[(r, j)]).product()
        })
    }

    /// Names of the expanded columns, e.g. `1`, `rsi`, `rsi obv`.
    pub fn term_names(&self, features: &[String]) -> Vec<String> {
        self.terms
            .iter()
            .map(|term| {
                if term.is_empty() {
                    "1".to_string()
                } else {
                    term.iter()
                        .map(|&j| features.get(j).cloned().unwrap_or_else(|| format!("x{j}")))
                        .collect::<Vec<_>>()
                        .join(" ")
                }
            })
            .collect()
    }

    pub fn linear(&self) -> &LinearRegression {
        &self.linear
    }
}

impl Regressor for PolynomialRegression {
    fn fit(&mut self, x: &DMatrix<f64>, y: &DVector<f64>) -> Result<(), ModelError> {
        check_dimensions(x, y)?;
        self.terms = interaction_terms(x.ncols(), self.degree);
        debug!("Polynomial expansion: {} features -> {} terms", x.ncols(), self.terms.len());
        let expanded = self.expand(x);
        self.linear.fit(&expanded, y)
    }

    fn predict(&self, x: &DMatrix<f64>) -> Result<DVector<f64>, ModelError> {
        if self.terms.is_empty() {
            return Err(ModelError::NotFitted);
        }
        let n_features = self.terms.iter().flatten().max().map_or(0, |m| m + 1);
        if x.ncols() < n_features {
            return Err(ModelError::DimensionMismatch(format!(
                "model expects {} features, got {}",
                n_features,
                x.ncols()
            )));
        }
        self.linear.predict(&self.expand(x))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Model {
    Mlp(MlpRegressor),
    Linear(LinearRegression),
    Polynomial(PolynomialRegression),
    RandomForest(RandomForestRegressor),
}

impl Model {
    pub fn build(kind: ModelKind, params: &TrainingParams) -> Result<Self, ModelError> {
        Ok(match kind {
            ModelKind::Mlp => Model::Mlp(MlpRegressor::new(params.random_state)),
            ModelKind::Linear => Model::Linear(LinearRegression::new()),
            ModelKind::Polynomial => Model::Polynomial(PolynomialRegression::new(params.poly_degree)?),
            ModelKind::RandomForest => Model::RandomForest(RandomForestRegressor::new(
                params.n_estimators,
                params.random_state,
            )),
        })
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Model::Mlp(_) => ModelKind::Mlp,
            Model::Linear(_) => ModelKind::Linear,
            Model::Polynomial(_) => ModelKind::Polynomial,
            Model::RandomForest(_) => ModelKind::RandomForest,
        }
    }

    /// Fitted equation for the linear families, `None` for the others.
    pub fn equation(&self, features: &[String]) -> Option<String> {
        let (linear, names) = match self {
            Model::Linear(m) => (m, features.to_vec()),
            Model::Polynomial(m) => (m.linear(), m.term_names(features)),
            _ => return None,
        };
        let coefficients = linear.coefficients.as_ref()?;
        let mut equation = format!("y = {:.4}", linear.intercept);
        for (name, coef) in names.iter().zip(coefficients.iter()) {
            equation.push_str(&format!(" + ({coef:.4} * {name})"));
        }
        Some(equation)
    }
}

impl Regressor for Model {
    fn fit(&mut self, x: &DMatrix<f64>, y: &DVector<f64>) -> Result<(), ModelError> {
        match self {
            Model::Mlp(m) => m.fit(x, y),
            Model::Linear(m) => m.fit(x, y),
            Model::Polynomial(m) => m.fit(x, y),
            Model::RandomForest(m) => m.fit(x, y),
        }
    }

    fn predict(&self, x: &DMatrix<f64>) -> Result<DVector<f64>, ModelError> {
        match self {
            Model::Mlp(m) => m.predict(x),
            Model::Linear(m) => m.predict(x),
            Model::Polynomial(m) => m.predict(x),
            Model::RandomForest(m) => m.predict(x),
        }
    }
}

/// On-disk form of a trained model together with the features it expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedModel {
    pub kind: ModelKind,
    pub features: Vec<String>,
    pub model: Model,
}

impl SavedModel {
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let file = File::create(path)
            .map_err(|e| ModelError::PersistenceError(format!("{}: {}", path.display(), e)))?;
        serde_json::to_writer(BufWriter::new(file), self)
            .map_err(|e| ModelError::PersistenceError(e.to_string()))?;
        info!("Saved {} model to {}", self.kind, path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let file = File::open(path)
            .map_err(|e| ModelError::PersistenceError(format!("{}: {}", path.display(), e)))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| ModelError::PersistenceError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn line_data() -> (DMatrix<f64>, DVector<f64>) {
        let x = DMatrix::from_row_slice(5, 2, &[1.0, 0.0, 2.0, 1.0, 3.0, 0.0, 4.0, 1.0, 5.0, 3.0]);
        let y = DVector::from_iterator(5, x.row_iter().map(|r| 1.5 + 2.0 * r[0] - 0.5 * r[1]));
        (x, y)
    }

    #[test]
    fn test_model_kind_parsing_and_prefixes() {
        assert_eq!("mlp".parse::<ModelKind>().unwrap(), ModelKind::Mlp);
        assert_eq!("RandomForest".parse::<ModelKind>().unwrap(), ModelKind::RandomForest);
        assert_eq!("random_forest".parse::<ModelKind>().unwrap(), ModelKind::RandomForest);
        assert!("svm".parse::<ModelKind>().is_err());
        assert_eq!(ModelKind::Polynomial.file_prefix(), "polynomial");
        assert_eq!(ModelKind::Mlp.to_string(), "MLP");
    }

    #[test]
    fn test_linear_regression_recovers_coefficients() {
        let (x, y) = line_data();
        let mut model = LinearRegression::new();
        model.fit(&x, &y).unwrap();
        let coefs = model.coefficients.as_ref().unwrap();
        assert_relative_eq!(model.intercept, 1.5, epsilon = 1e-9);
        assert_relative_eq!(coefs[0], 2.0, epsilon = 1e-9);
        assert_relative_eq!(coefs[1], -0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_linear_regression_errors() {
        let model = LinearRegression::new();
        assert!(matches!(model.predict(&DMatrix::zeros(1, 2)), Err(ModelError::NotFitted)));

        let (x, y) = line_data();
        let mut model = LinearRegression::new();
        assert!(model.fit(&x, &y.rows(0, 3).into_owned()).is_err());
        model.fit(&x, &y).unwrap();
        assert!(matches!(
            model.predict(&DMatrix::zeros(1, 3)),
            Err(ModelError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_every_family_rejects_matrix_without_columns() {
        let params = TrainingParams::default();
        for kind in ModelKind::ALL {
            let mut model = Model::build(kind, &params).unwrap();
            let result = model.fit(&DMatrix::zeros(8, 0), &DVector::zeros(8));
            assert!(matches!(result, Err(ModelError::DimensionMismatch(_))), "{kind} accepted no columns");
        }
    }

    #[test]
    fn test_interaction_terms_order() {
        assert_eq!(
            interaction_terms(3, 2),
            vec![
                vec![],
                vec![0],
                vec![1],
                vec![2],
                vec![0, 1],
                vec![0, 2],
                vec![1, 2]
            ]
        );
        assert_eq!(interaction_terms(2, 5).len(), 4);
    }

    #[test]
    fn test_polynomial_fits_interaction() {
        let x = DMatrix::from_fn(30, 2, |r, c| ((r * (c + 3)) % 7) as f64 + r as f64 * 0.1);
        let y = DVector::from_iterator(30, x.row_iter().map(|r| 1.0 + r[0] + 0.5 * r[0] * r[1]));
        let mut model = PolynomialRegression::new(2).unwrap();
        model.fit(&x, &y).unwrap();
        let pred = model.predict(&x).unwrap();
        for (p, t) in pred.iter().zip(y.iter()) {
            assert_relative_eq!(p, t, epsilon = 1e-6);
        }
        let names = model.term_names(&["a".to_string(), "b".to_string()]);
        assert_eq!(names, vec!["1", "a", "b", "a b"]);
    }

    #[test]
    fn test_polynomial_degree_bounds() {
        assert!(matches!(PolynomialRegression::new(1), Err(ModelError::InvalidDegree(1))));
        assert!(PolynomialRegression::new(11).is_err());
        assert!(PolynomialRegression::new(10).is_ok());
    }

    #[test]
    fn test_equation_for_linear_only() {
        let (x, y) = line_data();
        let params = TrainingParams {
            kfolds: 5,
            poly_degree: 2,
            n_estimators: 3,
            validation_split: 0.1,
            random_state: 42,
        };
        let mut model = Model::build(ModelKind::Linear, &params).unwrap();
        model.fit(&x, &y).unwrap();
        let eq = model.equation(&["a".to_string(), "b".to_string()]).unwrap();
        assert!(eq.starts_with("y = 1.5000"));
        assert!(eq.contains("* a)"));

        let forest = Model::build(ModelKind::RandomForest, &params).unwrap();
        assert!(forest.equation(&[]).is_none());
    }

    #[test]
    fn test_saved_model_round_trip() {
        let (x, y) = line_data();
        let mut model = Model::Linear(LinearRegression::new());
        model.fit(&x, &y).unwrap();
        let saved = SavedModel {
            kind: ModelKind::Linear,
            features: vec!["a".to_string(), "b".to_string()],
            model,
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linear_BTC_USDT.json");
        saved.save(&path).unwrap();
        let loaded = SavedModel::load(&path).unwrap();
        assert_eq!(loaded.kind, ModelKind::Linear);
        assert_eq!(loaded.features, saved.features);
        let before = saved.model.predict(&x).unwrap();
        let after = loaded.model.predict(&x).unwrap();
        assert_relative_eq!(before, after, epsilon = 1e-12);
    }
}
