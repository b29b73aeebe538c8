use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use common::config::TrainingConfig;
use common::error::{QhmmError, Result};
use crate::qhmm::TrainableQhmm;

/// KL 散度中模型概率的下限
const PROBABILITY_FLOOR: f64 = 1e-10;

/// 目标分布与模型分布之间的损失
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LossFunction {
    /// Σ p·ln(p / max(q, 1e-10))
    KlDivergence,
    /// ½·Σ |p - q|
    TotalVariation,
}

impl LossFunction {
    pub fn evaluate(&self, target: &BTreeMap<String, f64>, model: &BTreeMap<String, f64>) -> f64 {
        match self {
            LossFunction::KlDivergence => target
                .iter()
                .filter(|(_, &p)| p > 0.0)
                .map(|(key, &p)| {
                    let q = model.get(key).copied().unwrap_or(0.0).max(PROBABILITY_FLOOR);
                    p * (p / q).ln()
                })
                .sum(),
            LossFunction::TotalVariation => {
                let mut diff: f64 = target
                    .iter()
                    .map(|(key, &p)| (p - model.get(key).copied().unwrap_or(0.0)).abs())
                    .sum();
                diff += model
                    .iter()
                    .filter(|(key, _)| !target.contains_key(*key))
                    .map(|(_, &q)| q)
                    .sum::<f64>();
                0.5 * diff
            }
        }
    }
}

impl FromStr for LossFunction {
    type Err = QhmmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "kl" | "kl_divergence" => Ok(LossFunction::KlDivergence),
            "tv" | "total_variation" => Ok(LossFunction::TotalVariation),
            other => Err(QhmmError::Config(format!("unknown loss function '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Optimizer {
    GradientDescent { learning_rate: f64 },
    Adam { learning_rate: f64, beta1: f64, beta2: f64, eps: f64 },
}

impl Optimizer {
    pub fn adam(learning_rate: f64) -> Self {
        Optimizer::Adam { learning_rate, beta1: 0.9, beta2: 0.999, eps: 1e-8 }
    }

    pub fn from_name(name: &str, learning_rate: f64) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "adam" => Ok(Self::adam(learning_rate)),
            "gd" | "gradient_descent" => Ok(Optimizer::GradientDescent { learning_rate }),
            other => Err(QhmmError::Config(format!("unknown optimizer '{}'", other))),
        }
    }
}

/// Adam 的一阶、二阶矩
struct Moments {
    first: Vec<f64>,
    second: Vec<f64>,
    step: i32,
}

impl Optimizer {
    fn update(&self, params: &mut [f64], grad: &[f64], moments: &mut Moments) {
        match *self {
            Optimizer::GradientDescent { learning_rate } => {
                for (p, g) in params.iter_mut().zip(grad) {
                    *p -= learning_rate * g;
                }
            }
            Optimizer::Adam { learning_rate, beta1, beta2, eps } => {
                moments.step += 1;
                let bias1 = 1.0 - beta1.powi(moments.step);
                let bias2 = 1.0 - beta2.powi(moments.step);
                for i in 0..params.len() {
                    moments.first[i] = beta1 * moments.first[i] + (1.0 - beta1) * grad[i];
                    moments.second[i] = beta2 * moments.second[i] + (1.0 - beta2) * grad[i] * grad[i];
                    let m_hat = moments.first[i] / bias1;
                    let v_hat = moments.second[i] / bias2;
                    params[i] -= learning_rate * m_hat / (v_hat.sqrt() + eps);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub optimizer: Optimizer,
    pub loss: LossFunction,
    pub max_epochs: usize,
    /// 有限差分步长
    pub epsilon: f64,
    /// 损失改善低于该值视为停滞
    pub tolerance: f64,
    /// 连续停滞多少轮后停止
    pub patience: usize,
    pub seed: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            optimizer: Optimizer::adam(0.1),
            loss: LossFunction::KlDivergence,
            max_epochs: 200,
            epsilon: 1e-4,
            tolerance: 1e-7,
            patience: 10,
            seed: 7,
        }
    }
}

impl TrainerConfig {
    pub fn from_config(config: &TrainingConfig) -> Result<Self> {
        Ok(Self {
            optimizer: Optimizer::from_name(&config.optimizer, config.learning_rate)?,
            loss: config.loss.parse()?,
            max_epochs: config.max_epochs,
            epsilon: config.epsilon,
            tolerance: config.tolerance,
            patience: config.patience,
            seed: config.seed,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    /// 损失最小时的参数
    pub parameters: Vec<f64>,
    pub loss: f64,
    pub history: Vec<f64>,
    pub epochs: usize,
    pub converged: bool,
}

/// 计数归一化为概率
pub fn normalize_counts(counts: &BTreeMap<String, u64>) -> BTreeMap<String, f64> {
    let total: u64 = counts.values().sum();
    if total == 0 {
        return BTreeMap::new();
    }
    counts
        .iter()
        .map(|(key, &c)| (key.clone(), c as f64 / total as f64))
        .collect()
}

/// 用有限差分梯度拟合 QHMM 的发射分布
pub struct QhmmTrainer<'a> {
    qhmm: &'a TrainableQhmm,
    config: TrainerConfig,
}

impl<'a> QhmmTrainer<'a> {
    pub fn new(qhmm: &'a TrainableQhmm, config: TrainerConfig) -> Self {
        Self { qhmm, config }
    }

    fn loss(&self, target: &BTreeMap<String, f64>, params: &[f64]) -> Result<f64> {
        let model = self.qhmm.distribution(params)?;
        Ok(self.config.loss.evaluate(target, &model))
    }

    /// 中心差分梯度
    fn gradient(&self, target: &BTreeMap<String, f64>, params: &[f64]) -> Result<Vec<f64>> {
        let eps = self.config.epsilon;
        let mut shifted = params.to_vec();
        let mut grad = Vec::with_capacity(params.len());
        for i in 0..params.len() {
            shifted[i] = params[i] + eps;
            let plus = self.loss(target, &shifted)?;
            shifted[i] = params[i] - eps;
            let minus = self.loss(target, &shifted)?;
            shifted[i] = params[i];
            grad.push((plus - minus) / (2.0 * eps));
        }
        Ok(grad)
    }

    fn check_target(&self, target: &BTreeMap<String, f64>) -> Result<BTreeMap<String, f64>> {
        let width = self.qhmm.num_time_steps() * self.qhmm.num_emission_bits();
        if let Some(key) = target.keys().find(|k| k.len() != width) {
            return Err(QhmmError::DimensionMismatch {
                expected: width,
                actual: key.len(),
                context: format!("target key '{}'", key),
            });
        }
        if target.values().any(|p| *p < 0.0 || !p.is_finite()) {
            return Err(QhmmError::invalid("target probabilities must be finite and non-negative"));
        }
        let total: f64 = target.values().sum();
        if total <= 0.0 {
            return Err(QhmmError::invalid("target distribution is empty"));
        }
        Ok(target.iter().map(|(k, p)| (k.clone(), p / total)).collect())
    }

    pub fn fit(&self, target: &BTreeMap<String, f64>, initial: Option<Vec<f64>>) -> Result<TrainingReport> {
        let target = self.check_target(target)?;
        let num_params = self.qhmm.num_parameters();
        let mut params = match initial {
            Some(p) if p.len() != num_params => {
                return Err(QhmmError::DimensionMismatch {
                    expected: num_params,
                    actual: p.len(),
                    context: "initial parameters".to_string(),
                })
            }
            Some(p) => p,
            None => {
                let mut rng = StdRng::seed_from_u64(self.config.seed);
                (0..num_params).map(|_| rng.gen_range(0.0..2.0 * PI)).collect()
            }
        };

        info!(
            "Training QHMM: {} parameters, {} target outcomes, {:?}",
            num_params,
            target.len(),
            self.config.optimizer
        );

        let mut moments = Moments {
            first: vec![0.0; num_params],
            second: vec![0.0; num_params],
            step: 0,
        };
        let mut best_loss = self.loss(&target, &params)?;
        let mut best_params = params.clone();
        let mut history = vec![best_loss];
        let mut stale = 0;
        let mut converged = false;
        let mut epochs = 0;

        for epoch in 0..self.config.max_epochs {
            let grad = self.gradient(&target, &params)?;
            self.config.optimizer.update(&mut params, &grad, &mut moments);
            let loss = self.loss(&target, &params)?;
            history.push(loss);
            epochs = epoch + 1;

            if best_loss - loss < self.config.tolerance {
                stale += 1;
            } else {
                stale = 0;
            }
            if loss < best_loss {
                best_loss = loss;
                best_params.copy_from_slice(&params);
            }
            debug!("epoch {}: loss {:.6e}", epochs, loss);

            if stale >= self.config.patience {
                converged = true;
                break;
            }
        }

        info!(
            "Training finished after {} epochs: loss {:.6e} (converged: {})",
            epochs, best_loss, converged
        );
        Ok(TrainingReport {
            parameters: best_params,
            loss: best_loss,
            history,
            epochs,
            converged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use circuit_sim::Circuit;

    fn one_qubit_qhmm() -> TrainableQhmm {
        TrainableQhmm::builder()
            .num_qubits(1)
            .initial_state(Circuit::new(1, 0))
            .build()
            .unwrap()
    }

    fn target() -> BTreeMap<String, f64> {
        BTreeMap::from([("1".to_string(), 0.3), ("0".to_string(), 0.7)])
    }

    #[test]
    fn test_loss_functions() {
        let p = target();
        assert!(LossFunction::KlDivergence.evaluate(&p, &p).abs() < 1e-15);
        assert!(LossFunction::TotalVariation.evaluate(&p, &p).abs() < 1e-15);

        let q = BTreeMap::from([("0".to_string(), 1.0)]);
        assert!((LossFunction::TotalVariation.evaluate(&p, &q) - 0.3).abs() < 1e-12);
        // q("1") = 0 被截断到 1e-10
        let kl = LossFunction::KlDivergence.evaluate(&p, &q);
        let expected = 0.3 * (0.3f64 / 1e-10).ln() + 0.7 * 0.7f64.ln();
        assert!((kl - expected).abs() < 1e-9);

        let r = BTreeMap::from([("11".to_string(), 1.0)]);
        assert!((LossFunction::TotalVariation.evaluate(&p, &r) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("kl".parse::<LossFunction>().unwrap(), LossFunction::KlDivergence);
        assert_eq!("TV".parse::<LossFunction>().unwrap(), LossFunction::TotalVariation);
        assert!("mse".parse::<LossFunction>().is_err());
        assert!(matches!(Optimizer::from_name("adam", 0.1).unwrap(), Optimizer::Adam { .. }));
        assert!(Optimizer::from_name("sgd-momentum", 0.1).is_err());
    }

    #[test]
    fn test_normalize_counts() {
        let counts = BTreeMap::from([("0".to_string(), 3u64), ("1".to_string(), 1u64)]);
        let probs = normalize_counts(&counts);
        assert_eq!(probs["0"], 0.75);
        assert_eq!(probs["1"], 0.25);
        assert!(normalize_counts(&BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_gradient_descent_fits_single_qubit() {
        let qhmm = one_qubit_qhmm();
        assert_eq!(qhmm.num_parameters(), 8);
        let config = TrainerConfig {
            optimizer: Optimizer::GradientDescent { learning_rate: 0.1 },
            loss: LossFunction::KlDivergence,
            max_epochs: 200,
            tolerance: 1e-12,
            ..TrainerConfig::default()
        };
        let report = QhmmTrainer::new(&qhmm, config).fit(&target(), Some(vec![0.2; 8])).unwrap();

        assert!(report.loss < 1e-4, "loss {}", report.loss);
        assert!(report.history[0] > report.loss);
        let dist = qhmm.distribution(&report.parameters).unwrap();
        assert!((dist["1"] - 0.3).abs() < 0.01, "{:?}", dist);
    }

    #[test]
    fn test_adam_reduces_total_variation() {
        let qhmm = one_qubit_qhmm();
        let config = TrainerConfig {
            loss: LossFunction::TotalVariation,
            max_epochs: 60,
            ..TrainerConfig::default()
        };
        let report = QhmmTrainer::new(&qhmm, config).fit(&target(), None).unwrap();
        assert!(report.loss <= report.history[0]);
        assert!(report.epochs <= 60);
        assert_eq!(report.history.len(), report.epochs + 1);
        assert_eq!(report.parameters.len(), 8);
    }

    #[test]
    fn test_rejects_mismatched_target() {
        let qhmm = one_qubit_qhmm();
        let trainer = QhmmTrainer::new(&qhmm, TrainerConfig::default());
        let wide = BTreeMap::from([("01".to_string(), 1.0)]);
        assert!(trainer.fit(&wide, None).is_err());
        assert!(trainer.fit(&target(), Some(vec![0.0; 3])).is_err());
        assert!(trainer.fit(&BTreeMap::new(), None).is_err());
    }
}
