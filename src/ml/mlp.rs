//! Feed-forward ReLU network trained with Adam and early stopping.

use nalgebra::{DMatrix, DVector};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::metrics::r2_score;
use super::models::{check_dimensions, Regressor};
use crate::error::ModelError;

const BETA_1: f64 = 0.9;
const BETA_2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1e-8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpRegressor {
    pub hidden_layers: Vec<usize>,
    pub learning_rate: f64,
    /// L2 penalty.
    pub alpha: f64,
    pub batch_size: usize,
    pub max_iter: usize,
    pub validation_fraction: f64,
    pub n_iter_no_change: usize,
    pub tol: f64,
    pub seed: u64,
    coefs: Vec<DMatrix<f64>>,
    intercepts: Vec<DMatrix<f64>>,
    y_mean: f64,
    y_std: f64,
    n_iter: usize,
}

struct Adam {
    m: Vec<DMatrix<f64>>,
    v: Vec<DMatrix<f64>>,
    t: i32,
    learning_rate: f64,
}

impl Adam {
    fn new(params: &[DMatrix<f64>], learning_rate: f64) -> Self {
        let zeros: Vec<DMatrix<f64>> = params
            .iter()
            .map(|p| DMatrix::zeros(p.nrows(), p.ncols()))
            .collect();
        Self {
            m: zeros.clone(),
            v: zeros,
            t: 0,
            learning_rate,
        }
    }

    fn step(&mut self, params: &mut [DMatrix<f64>], grads: &[DMatrix<f64>]) {
        self.t += 1;
        let lr = self.learning_rate * (1.0 - BETA_2.powi(self.t)).sqrt() / (1.0 - BETA_1.powi(self.t));
        for ((p, g), (m, v)) in params
            .iter_mut()
            .zip(grads)
            .zip(self.m.iter_mut().zip(self.v.iter_mut()))
        {
            *m = &*m * BETA_1 + g * (1.0 - BETA_1);
            *v = &*v * BETA_2 + g.map(|x| x * x) * (1.0 - BETA_2);
            *p -= m.zip_map(v, |m, v| lr * m / (v.sqrt() + ADAM_EPSILON));
        }
    }
}

fn relu(z: DMatrix<f64>) -> DMatrix<f64> {
    z.map(|v| v.max(0.0))
}

impl MlpRegressor {
    /// Two hidden layers of 100 and 50 units.
    pub fn new(seed: u64) -> Self {
        Self {
            hidden_layers: vec![100, 50],
            learning_rate: 0.001,
            alpha: 0.001,
            batch_size: 200,
            max_iter: 1000,
            validation_fraction: 0.2,
            n_iter_no_change: 50,
            tol: 1e-4,
            seed,
            coefs: Vec::new(),
            intercepts: Vec::new(),
            y_mean: 0.0,
            y_std: 1.0,
            n_iter: 0,
        }
    }

    pub fn n_iter(&self) -> usize {
        self.n_iter
    }

    fn initialize(&mut self, n_features: usize, rng: &mut ChaCha8Rng) {
        let mut sizes = vec![n_features];
        sizes.extend(&self.hidden_layers);
        sizes.push(1);

        self.coefs.clear();
        self.intercepts.clear();
        for pair in sizes.windows(2) {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
            self.coefs
                .push(DMatrix::from_fn(fan_in, fan_out, |_, _| rng.gen_range(-bound..bound)));
            self.intercepts
                .push(DMatrix::from_fn(1, fan_out, |_, _| rng.gen_range(-bound..bound)));
        }
    }

    /// Activations of every layer, input included. The last one is the
    /// linear output.
    fn forward(&self, x: &DMatrix<f64>) -> Vec<DMatrix<f64>> {
        let ones = DMatrix::from_element(x.nrows(), 1, 1.0);
        let last = self.coefs.len() - 1;
        let mut activations = vec![x.clone()];
        for (layer, (w, b)) in self.coefs.iter().zip(&self.intercepts).enumerate() {
            let z = &activations[layer] * w + &ones * b;
            activations.push(if layer == last { z } else { relu(z) });
        }
        activations
    }

    fn output(&self, x: &DMatrix<f64>) -> DVector<f64> {
        let out = self.forward(x).pop().unwrap_or_else(|| DMatrix::zeros(x.nrows(), 1));
        out.column(0).into_owned()
    }

    /// Squared loss plus L2 penalty, and gradients in `[coefs.., intercepts..]`
    /// order.
    fn loss_and_gradients(&self, x: &DMatrix<f64>, y: &DVector<f64>) -> (f64, Vec<DMatrix<f64>>) {
        let m = x.nrows() as f64;
        let activations = self.forward(x);
        let layers = self.coefs.len();

        let output = &activations[layers];
        let mut delta = DMatrix::from_fn(x.nrows(), 1, |r, _| output[(r, 0)] - y[r]);
        let penalty: f64 = self.coefs.iter().map(|w| w.norm_squared()).sum();
        let loss = delta.norm_squared() / (2.0 * m) + self.alpha * penalty / (2.0 * m);
        delta /= m;

        let mut coef_grads: Vec<DMatrix<f64>> = vec![DMatrix::zeros(0, 0); layers];
        let mut intercept_grads: Vec<DMatrix<f64>> = vec![DMatrix::zeros(0, 0); layers];
        let ones_row = DMatrix::from_element(1, x.nrows(), 1.0);
        for layer in (0..layers).rev() {
            coef_grads[layer] =
                activations[layer].transpose() * &delta + &self.coefs[layer] * (self.alpha / m);
            intercept_grads[layer] = &ones_row * &delta;
            if layer > 0 {
                let mask = activations[layer].map(|a| if a > 0.0 { 1.0 } else { 0.0 });
                delta = (&delta * self.coefs[layer].transpose()).component_mul(&mask);
            }
        }
        coef_grads.extend(intercept_grads);
        (loss, coef_grads)
    }

    fn take_params(&mut self) -> Vec<DMatrix<f64>> {
        let mut params = std::mem::take(&mut self.coefs);
        params.append(&mut self.intercepts);
        params
    }

    fn put_params(&mut self, mut params: Vec<DMatrix<f64>>) {
        let layers = params.len() / 2;
        self.intercepts = params.split_off(layers);
        self.coefs = params;
    }
}

fn select_rows(x: &DMatrix<f64>, rows: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(rows.len(), x.ncols(), |r, c| x[(rows[r], c)])
}

impl Regressor for MlpRegressor {
    fn fit(&mut self, x: &DMatrix<f64>, y: &DVector<f64>) -> Result<(), ModelError> {
        check_dimensions(x, y)?;
        let n = x.nrows();

        self.y_mean = y.mean();
        let std = (y.iter().map(|v| (v - self.y_mean).powi(2)).sum::<f64>() / n as f64).sqrt();
        self.y_std = if std > 0.0 { std } else { 1.0 };
        let y_scaled = y.map(|v| (v - self.y_mean) / self.y_std);

        // Early stopping watches the most recent rows.
        let n_val = (n as f64 * self.validation_fraction).ceil() as usize;
        let early_stopping = n_val >= 2 && n - n_val >= 1;
        let n_train = if early_stopping { n - n_val } else { n };
        let x_train = x.rows(0, n_train).into_owned();
        let y_train = y_scaled.rows(0, n_train).into_owned();
        let validation = early_stopping.then(|| {
            (
                x.rows(n_train, n_val).into_owned(),
                y_scaled.rows(n_train, n_val).into_owned(),
            )
        });

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        self.initialize(x.ncols(), &mut rng);

        let mut params = self.take_params();
        let mut adam = Adam::new(&params, self.learning_rate);
        self.put_params(params);

        let batch_size = self.batch_size.clamp(1, n_train);
        let mut order: Vec<usize> = (0..n_train).collect();
        let mut best_score = f64::NEG_INFINITY;
        let mut best_loss = f64::INFINITY;
        let mut best_params: Option<Vec<DMatrix<f64>>> = None;
        let mut no_improvement = 0;

        self.n_iter = 0;
        for epoch in 0..self.max_iter {
            order.shuffle(&mut rng);
            let mut epoch_loss = 0.0;
            for batch in order.chunks(batch_size) {
                let xb = select_rows(&x_train, batch);
                let yb = DVector::from_iterator(batch.len(), batch.iter().map(|&i| y_train[i]));
                let (loss, grads) = self.loss_and_gradients(&xb, &yb);
                epoch_loss += loss * batch.len() as f64;

                params = self.take_params();
                adam.step(&mut params, &grads);
                self.put_params(params);
            }
            epoch_loss /= n_train as f64;
            self.n_iter = epoch + 1;

            if !epoch_loss.is_finite() {
                return Err(ModelError::TrainingError(format!(
                    "loss diverged at epoch {}",
                    epoch + 1
                )));
            }

            match &validation {
                Some((x_val, y_val)) => {
                    let predicted = self.output(x_val);
                    let score = r2_score(y_val.as_slice(), predicted.as_slice());
                    if score < best_score + self.tol {
                        no_improvement += 1;
                    } else {
                        no_improvement = 0;
                    }
                    if score > best_score {
                        best_score = score;
                        let mut snapshot = self.coefs.clone();
                        snapshot.extend(self.intercepts.iter().cloned());
                        best_params = Some(snapshot);
                    }
                }
                None => {
                    if epoch_loss > best_loss - self.tol {
                        no_improvement += 1;
                    } else {
                        no_improvement = 0;
                    }
                    best_loss = best_loss.min(epoch_loss);
                }
            }

            if no_improvement > self.n_iter_no_change {
                debug!(
                    "Stopping after {} epochs without improvement (epoch {})",
                    self.n_iter_no_change,
                    epoch + 1
                );
                break;
            }
        }

        if let Some(best) = best_params {
            self.put_params(best);
        }
        debug!("MLP trained for {} epochs, best validation R2 {:.4}", self.n_iter, best_score);
        Ok(())
    }

    fn predict(&self, x: &DMatrix<f64>) -> Result<DVector<f64>, ModelError> {
        let first = self.coefs.first().ok_or(ModelError::NotFitted)?;
        if x.ncols() != first.nrows() {
            return Err(ModelError::DimensionMismatch(format!(
                "model expects {} features, got {}",
                first.nrows(),
                x.ncols()
            )));
        }
        Ok(self.output(x).map(|v| v * self.y_std + self.y_mean))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_distr::{Distribution, Normal};

    fn small(seed: u64) -> MlpRegressor {
        let mut model = MlpRegressor::new(seed);
        model.hidden_layers = vec![16, 8];
        model.max_iter = 300;
        model.learning_rate = 0.01;
        model
    }

    fn noisy_plane(n: usize) -> (DMatrix<f64>, DVector<f64>) {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let noise = Normal::new(0.0, 0.05).unwrap();
        let x = DMatrix::from_fn(n, 2, |_, _| rng.gen_range(-1.0..1.0));
        let y = DVector::from_fn(n, |r, _| {
            100.0 + 5.0 * x[(r, 0)] - 3.0 * x[(r, 1)] + noise.sample(&mut rng)
        });
        (x, y)
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let (x, y) = noisy_plane(12);
        let mut model = small(1);
        model.hidden_layers = vec![4];
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        model.initialize(2, &mut rng);

        let (_, grads) = model.loss_and_gradients(&x, &y);
        let h = 1e-6;
        let mut bumped = model.clone();
        bumped.coefs[0][(1, 2)] += h;
        let (plus, _) = bumped.loss_and_gradients(&x, &y);
        bumped.coefs[0][(1, 2)] -= 2.0 * h;
        let (minus, _) = bumped.loss_and_gradients(&x, &y);
        let numeric = (plus - minus) / (2.0 * h);
        let analytic = grads[0][(1, 2)];
        assert!((numeric - analytic).abs() < 1e-4 * analytic.abs().max(1.0));
    }

    #[test]
    fn test_learns_linear_target() {
        let (x, y) = noisy_plane(300);
        let mut model = small(42);
        model.fit(&x, &y).unwrap();
        let pred = model.predict(&x).unwrap();
        assert!(r2_score(y.as_slice(), pred.as_slice()) > 0.9);
        assert!(model.n_iter() > 0 && model.n_iter() <= 300);
    }

    #[test]
    fn test_seeded_training_is_reproducible() {
        let (x, y) = noisy_plane(60);
        let mut a = small(7);
        let mut b = small(7);
        a.max_iter = 20;
        b.max_iter = 20;
        a.fit(&x, &y).unwrap();
        b.fit(&x, &y).unwrap();
        assert_eq!(a.predict(&x).unwrap(), b.predict(&x).unwrap());
    }

    #[test]
    fn test_predict_checks_shape() {
        let model = MlpRegressor::new(42);
        assert!(matches!(model.predict(&DMatrix::zeros(2, 3)), Err(ModelError::NotFitted)));

        let (x, y) = noisy_plane(10);
        let mut model = small(1);
        model.max_iter = 5;
        model.fit(&x, &y).unwrap();
        assert!(model.predict(&DMatrix::zeros(2, 3)).is_err());
    }
}
