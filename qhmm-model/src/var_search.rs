//! VaR 阈值搜索：对亏损阈值做二分，找到满足置信度的最大阈值

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info};

use common::bits::num_bits_for;
use common::error::{QhmmError, Result};
use crate::amplitude_estimation::{exact_amplitude, AmplitudeEstimate, MaximumLikelihoodAe};
use crate::classical_var::{classical_var, exact_loss_probability};
use crate::hmm::{ClassicalHmm, EmissionSampler};
use crate::qhmm::TrainableQhmm;
use crate::var_circuit::{precision_from_growths, var_circuit};

/// 给出 P(总收益 < loss) 的估计器
pub trait LossProbability {
    fn loss_probability(&mut self, loss: f64) -> Result<f64>;
}

/// 枚举经典 HMM 的全部发射序列
pub struct ExactClassical<'a> {
    hmm: &'a ClassicalHmm,
    num_time_steps: usize,
    growths: Vec<f64>,
}

impl<'a> ExactClassical<'a> {
    pub fn new(hmm: &'a ClassicalHmm, num_time_steps: usize, growths: Vec<f64>) -> Self {
        Self { hmm, num_time_steps, growths }
    }
}

impl LossProbability for ExactClassical<'_> {
    fn loss_probability(&mut self, loss: f64) -> Result<f64> {
        exact_loss_probability(self.hmm, self.num_time_steps, &self.growths, loss)
    }
}

/// 经典蒙特卡洛
pub struct MonteCarlo<'a> {
    sampler: &'a dyn EmissionSampler,
    num_time_steps: usize,
    num_samples: usize,
    growths: Vec<f64>,
    rng: StdRng,
}

impl<'a> MonteCarlo<'a> {
    pub fn new(
        sampler: &'a dyn EmissionSampler,
        num_time_steps: usize,
        num_samples: usize,
        growths: Vec<f64>,
        seed: u64,
    ) -> Self {
        Self {
            sampler,
            num_time_steps,
            num_samples,
            growths,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl LossProbability for MonteCarlo<'_> {
    fn loss_probability(&mut self, loss: f64) -> Result<f64> {
        classical_var(
            self.sampler,
            self.num_time_steps,
            self.num_samples,
            &self.growths,
            loss,
            &mut self.rng,
        )
    }
}

/// 收益在 2^-fp 格点上的判定容差
const GRID_TOLERANCE: f64 = 1e-9;

/// 在训练好的 QHMM 后接 VaR 线路，读取符号位的概率。
///
/// 未配置振幅估计时直接取精确振幅。各期收益必须落在价值寄存器的
/// 2^-fp 格点上；任意阈值先被挪到等价的半格点再交给比较器，
/// 这样 P(总收益 < loss) 对所有阈值都是精确的。
pub struct QuantumEstimator<'a> {
    qhmm: &'a TrainableQhmm,
    params: Vec<f64>,
    growths: Vec<f64>,
    num_val_qubits: usize,
    fractional_precision: i32,
    /// 总收益在格点单位下的取值范围
    min_total: i64,
    max_total: i64,
    amplitude_estimator: Option<MaximumLikelihoodAe>,
    rng: StdRng,
    last_estimate: Option<AmplitudeEstimate>,
}

impl<'a> QuantumEstimator<'a> {
    pub fn new(qhmm: &'a TrainableQhmm, params: Vec<f64>, growths: Vec<f64>, num_val_qubits: usize) -> Result<Self> {
        let state_qubits = num_bits_for(growths.len());
        if qhmm.num_emission_bits() != state_qubits {
            return Err(QhmmError::DimensionMismatch {
                expected: state_qubits,
                actual: qhmm.num_emission_bits(),
                context: format!("emission qubits per step for {} growths", growths.len()),
            });
        }
        if params.len() != qhmm.num_parameters() {
            return Err(QhmmError::DimensionMismatch {
                expected: qhmm.num_parameters(),
                actual: params.len(),
                context: "QHMM parameters".to_string(),
            });
        }

        if num_val_qubits < 2 {
            return Err(QhmmError::invalid("the value register needs at least two qubits"));
        }
        let num_time_steps = qhmm.num_time_steps();
        let fractional_precision = precision_from_growths(&growths, num_val_qubits, num_time_steps)?;
        let scale = 2f64.powi(fractional_precision);
        let mut units = Vec::with_capacity(growths.len());
        for &g in &growths {
            let u = g * scale;
            if (u - u.round()).abs() > GRID_TOLERANCE {
                return Err(QhmmError::invalid(format!(
                    "growth {} is not a multiple of the register resolution {}",
                    g,
                    1.0 / scale
                )));
            }
            units.push(u.round() as i64);
        }
        // 多出来的控制态不加收益
        if growths.len() < 1 << state_qubits {
            units.push(0);
        }
        let steps = num_time_steps as i64;
        let min_total = steps * units.iter().copied().min().unwrap_or(0);
        let max_total = steps * units.iter().copied().max().unwrap_or(0);

        // 比较后的差值落在 [-(D+1), D]，必须装得进补码寄存器
        let spread = max_total - min_total;
        let capacity = 1i64 << (num_val_qubits.min(62) as u32 - 1);
        if spread + 1 > capacity {
            return Err(QhmmError::invalid(format!(
                "{} value qubits cannot hold a growth spread of {} units; add value qubits",
                num_val_qubits, spread
            )));
        }

        Ok(Self {
            qhmm,
            params,
            growths,
            num_val_qubits,
            fractional_precision,
            min_total,
            max_total,
            amplitude_estimator: None,
            rng: StdRng::seed_from_u64(0),
            last_estimate: None,
        })
    }

    pub fn with_amplitude_estimation(mut self, estimator: MaximumLikelihoodAe, seed: u64) -> Self {
        self.amplitude_estimator = Some(estimator);
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// 最近一次振幅估计的完整结果
    pub fn last_estimate(&self) -> Option<&AmplitudeEstimate> {
        self.last_estimate.as_ref()
    }

    /// 与 `loss` 给出相同亏损事件的半格点阈值
    ///
    /// 总收益 S 是整数格点，S < x 等价于 S < ceil(x) - 1/2。
    pub fn comparator_threshold(&self, loss: f64) -> f64 {
        let scale = 2f64.powi(self.fractional_precision);
        let ceiling = ((loss * scale).ceil() as i64).clamp(self.min_total, self.max_total + 1);
        (ceiling as f64 - 0.5) / scale
    }
}

impl LossProbability for QuantumEstimator<'_> {
    fn loss_probability(&mut self, loss: f64) -> Result<f64> {
        if !loss.is_finite() {
            return Err(QhmmError::invalid(format!("loss threshold must be finite, got {}", loss)));
        }
        let threshold = self.comparator_threshold(loss);
        let var = var_circuit(self.qhmm.num_time_steps(), &self.growths, threshold, self.num_val_qubits, false)?;
        let prep = self.qhmm.to_state_prep(&var.circuit, var.objective)?;
        match &self.amplitude_estimator {
            None => exact_amplitude(&prep.circuit, prep.objective, &self.params),
            Some(mlae) => {
                let bound = prep.circuit.bind(&self.params)?;
                let estimate = mlae.estimate(&bound, prep.objective, &mut self.rng)?;
                let probability = estimate.estimation;
                self.last_estimate = Some(estimate);
                Ok(probability)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VarResult {
    /// 满足 P(总收益 < 阈值) ≤ 1 - confidence 的最大阈值
    pub loss_threshold: f64,
    pub probability: f64,
    pub iterations: usize,
}

/// 二分搜索 VaR 阈值；要求 P(lower) ≤ 1 - confidence
pub fn value_at_risk(
    estimator: &mut dyn LossProbability,
    confidence: f64,
    lower: f64,
    upper: f64,
    tolerance: f64,
    max_iterations: usize,
) -> Result<VarResult> {
    if !(0.0..1.0).contains(&confidence) {
        return Err(QhmmError::invalid(format!("confidence must be in [0, 1), got {}", confidence)));
    }
    if !(lower < upper) || tolerance <= 0.0 {
        return Err(QhmmError::invalid(format!(
            "invalid search interval [{}, {}] with tolerance {}",
            lower, upper, tolerance
        )));
    }
    let alpha = 1.0 - confidence;

    let mut lo = lower;
    let mut p_lo = estimator.loss_probability(lo)?;
    if p_lo > alpha {
        return Err(QhmmError::invalid(format!(
            "P(loss < {}) = {} already exceeds {}; lower the search bound",
            lower, p_lo, alpha
        )));
    }
    let mut hi = upper;
    let p_hi = estimator.loss_probability(hi)?;
    if p_hi <= alpha {
        return Ok(VarResult { loss_threshold: upper, probability: p_hi, iterations: 0 });
    }

    let mut iterations = 0;
    while hi - lo > tolerance && iterations < max_iterations {
        let mid = 0.5 * (lo + hi);
        let p = estimator.loss_probability(mid)?;
        debug!("VaR search: P(total < {:.6}) = {:.6}", mid, p);
        if p <= alpha {
            lo = mid;
            p_lo = p;
        } else {
            hi = mid;
        }
        iterations += 1;
    }

    info!(
        "VaR at {:.1}% confidence: loss threshold {:.6} (P = {:.6}, {} iterations)",
        confidence * 100.0,
        lo,
        p_lo,
        iterations
    );
    Ok(VarResult { loss_threshold: lo, probability: p_lo, iterations })
}

#[cfg(test)]
mod tests {
    use super::*;
    use circuit_sim::Circuit;
    use common::bits::decode_sequence;

    fn example_hmm() -> ClassicalHmm {
        ClassicalHmm::new(
            vec![vec![0.7, 0.3], vec![0.4, 0.6]],
            vec![vec![0.9, 0.1], vec![0.2, 0.8]],
            vec![0.6, 0.4],
        )
        .unwrap()
    }

    #[test]
    fn test_exact_var_brackets_the_quantile() {
        let hmm = example_hmm();
        let growths = vec![0.05, -0.1];
        let mut exact = ExactClassical::new(&hmm, 4, growths);
        let tol = 1e-6;
        let result = value_at_risk(&mut exact, 0.9, -1.0, 1.0, tol, 100).unwrap();

        assert!(result.probability <= 0.1);
        assert!(exact.loss_probability(result.loss_threshold + 2.0 * tol).unwrap() > 0.1);
        assert!(result.iterations > 0);
    }

    #[test]
    fn test_search_interval_errors() {
        let hmm = example_hmm();
        let mut exact = ExactClassical::new(&hmm, 2, vec![0.05, -0.1]);
        // P(total < 1) = 1
        assert!(value_at_risk(&mut exact, 0.9, 1.0, 2.0, 1e-6, 50).is_err());
        assert!(value_at_risk(&mut exact, 1.5, -1.0, 1.0, 1e-6, 50).is_err());
        assert!(value_at_risk(&mut exact, 0.9, 1.0, -1.0, 1e-6, 50).is_err());

        let capped = value_at_risk(&mut exact, 0.0, -1.0, 1.0, 1e-6, 50).unwrap();
        assert_eq!(capped.loss_threshold, 1.0);
        assert_eq!(capped.iterations, 0);
    }

    #[test]
    fn test_monte_carlo_estimator() {
        let hmm = example_hmm();
        let growths = vec![0.05, -0.1];
        let mut mc = MonteCarlo::new(&hmm, 3, 5000, growths.clone(), 3);
        let mut exact = ExactClassical::new(&hmm, 3, growths);
        let p_mc = mc.loss_probability(0.0).unwrap();
        let p_exact = exact.loss_probability(0.0).unwrap();
        assert!((p_mc - p_exact).abs() < 0.03, "{} vs {}", p_mc, p_exact);
    }

    fn one_qubit_qhmm(steps: usize) -> TrainableQhmm {
        TrainableQhmm::builder()
            .num_qubits(1)
            .initial_state(Circuit::new(1, 0))
            .num_time_steps(steps)
            .build()
            .unwrap()
    }

    #[test]
    fn test_quantum_estimator_matches_qhmm_distribution() {
        let qhmm = one_qubit_qhmm(2);
        let params: Vec<f64> = (0..qhmm.num_parameters()).map(|i| 0.2 + 0.3 * i as f64).collect();
        let growths = vec![0.0, 0.25];
        // fp = 3，0.3125·8 = 2.5 落在半格点上
        let loss = 0.3125;

        let mut expected = 0.0;
        for (key, p) in qhmm.distribution(&params).unwrap() {
            let total: f64 = decode_sequence(&key, 1).unwrap().iter().map(|&e| growths[e]).sum();
            if total < loss {
                expected += p;
            }
        }

        let mut quantum = QuantumEstimator::new(&qhmm, params, growths, 4).unwrap();
        let p = quantum.loss_probability(loss).unwrap();
        assert!((p - expected).abs() < 1e-9, "{} vs {}", p, expected);
        assert!(quantum.last_estimate().is_none());
    }

    /// 直接枚举 QHMM 发射分布的估计器
    struct QhmmEnumeration {
        totals: Vec<(f64, f64)>,
    }

    impl QhmmEnumeration {
        fn new(qhmm: &TrainableQhmm, params: &[f64], growths: &[f64]) -> Self {
            let totals = qhmm
                .distribution(params)
                .unwrap()
                .into_iter()
                .map(|(key, p)| {
                    let total: f64 = decode_sequence(&key, 1).unwrap().iter().map(|&e| growths[e]).sum();
                    (total, p)
                })
                .collect();
            Self { totals }
        }
    }

    impl LossProbability for QhmmEnumeration {
        fn loss_probability(&mut self, loss: f64) -> Result<f64> {
            Ok(self.totals.iter().filter(|(t, _)| *t < loss).map(|(_, p)| p).sum())
        }
    }

    #[test]
    fn test_quantum_estimator_between_grid_points() {
        let qhmm = one_qubit_qhmm(4);
        let params: Vec<f64> = (0..qhmm.num_parameters()).map(|i| 0.3 + 0.4 * i as f64).collect();
        let growths = vec![0.0, 0.25];
        let mut enumeration = QhmmEnumeration::new(&qhmm, &params, &growths);
        let mut quantum = QuantumEstimator::new(&qhmm, params, growths, 4).unwrap();

        for loss in [-0.4, -0.03, 0.0, 0.2, 0.25, 0.3, 0.61, 1.0, 1.3] {
            let want = enumeration.loss_probability(loss).unwrap();
            let got = quantum.loss_probability(loss).unwrap();
            assert!((got - want).abs() < 1e-9, "loss {}: {} vs {}", loss, got, want);
        }

        let classical = value_at_risk(&mut enumeration, 0.9, -0.5, 1.5, 1e-4, 40).unwrap();
        let searched = value_at_risk(&mut quantum, 0.9, -0.5, 1.5, 1e-4, 40).unwrap();
        assert!((classical.loss_threshold - searched.loss_threshold).abs() < 1e-9);
        assert!((classical.probability - searched.probability).abs() < 1e-9);
        // 没有低于0的总收益
        assert!(searched.loss_threshold > -1e-3);
    }

    #[test]
    fn test_comparator_threshold_snaps_to_half_grid() {
        let qhmm = one_qubit_qhmm(4);
        let params = vec![0.0; qhmm.num_parameters()];
        // fp = 2：总收益取 0, 1/4, ..., 1
        let quantum = QuantumEstimator::new(&qhmm, params, vec![0.0, 0.25], 4).unwrap();
        assert_eq!(quantum.comparator_threshold(0.25), 0.125);
        assert_eq!(quantum.comparator_threshold(0.2), 0.125);
        assert_eq!(quantum.comparator_threshold(0.26), 0.375);
        // 超出范围的阈值夹到首末格点
        assert_eq!(quantum.comparator_threshold(-3.0), -0.125);
        assert_eq!(quantum.comparator_threshold(9.0), 1.125);
    }

    #[test]
    fn test_quantum_estimator_rejects_off_grid_growths() {
        let qhmm = one_qubit_qhmm(2);
        let params = vec![0.0; qhmm.num_parameters()];
        assert!(QuantumEstimator::new(&qhmm, params.clone(), vec![0.0, 0.1], 4).is_err());
        // fp = 0，两个价值比特装不下 [-3, 2] 的差值
        assert!(QuantumEstimator::new(&qhmm, params.clone(), vec![0.0, 1.0], 2).is_err());
        assert!(QuantumEstimator::new(&qhmm, params, vec![0.0, 1.0], 3).is_ok());
    }

    #[test]
    fn test_quantum_estimator_with_mlae() {
        let qhmm = one_qubit_qhmm(2);
        let params: Vec<f64> = (0..qhmm.num_parameters()).map(|i| 0.1 * i as f64).collect();
        let mlae = MaximumLikelihoodAe::new(vec![0, 1, 2, 4], 200, 0.95).unwrap();
        let mut exact = QuantumEstimator::new(&qhmm, params.clone(), vec![0.0, 0.25], 4).unwrap();
        let mut estimated = QuantumEstimator::new(&qhmm, params, vec![0.0, 0.25], 4)
            .unwrap()
            .with_amplitude_estimation(mlae, 9);

        let a = exact.loss_probability(0.3125).unwrap();
        let b = estimated.loss_probability(0.3125).unwrap();
        assert!((a - b).abs() < 0.05, "{} vs {}", a, b);
        assert!(estimated.last_estimate().is_some());
    }

    #[test]
    fn test_quantum_estimator_checks_emission_width() {
        let qhmm = one_qubit_qhmm(1);
        let params = vec![0.0; qhmm.num_parameters()];
        assert!(QuantumEstimator::new(&qhmm, params.clone(), vec![0.1, 0.2, 0.3, 0.4], 4).is_err());
        assert!(QuantumEstimator::new(&qhmm, vec![0.0], vec![0.1, 0.2], 4).is_err());
        assert!(QuantumEstimator::new(&qhmm, params, vec![0.125, 0.25], 4).is_ok());
    }
}
