//! 最大似然振幅估计（无需相位估计寄存器）
//!
//! 对若干 Grover 幂次 k 运行 Q^k·A 并对目标比特采样，
//! 命中概率为 sin²((2k+1)θ)，其中 a = sin²θ 为待估振幅。

use std::collections::BTreeMap;
use std::f64::consts::FRAC_PI_2;

use rand::Rng;
use rand_distr::{Binomial, Distribution};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};
use tracing::{debug, info};

use circuit_sim::{Circuit, Simulator};
use common::error::{QhmmError, Result};

/// 对数似然中概率的下限
const LOG_FLOOR: f64 = 1e-300;

/// Grover 算子 Q = A·S0·A†·Sχ（按作用顺序：Sχ, A†, S0, A）
pub fn grover_operator(state_prep: &Circuit, objective: usize) -> Result<Circuit> {
    if !state_prep.is_unitary() {
        return Err(QhmmError::NonUnitary(format!(
            "'{}' cannot be inverted for the Grover operator",
            state_prep.name()
        )));
    }
    if state_prep.num_parameters() != 0 {
        return Err(QhmmError::invalid("bind the state preparation before building Q"));
    }
    let n = state_prep.num_qubits();
    if objective >= n {
        return Err(QhmmError::QubitOutOfRange { index: objective, width: n });
    }
    let all: Vec<usize> = (0..n).collect();
    let mut q = Circuit::named("grover", n, 0);

    // Sχ：目标比特为1的态取负号
    q.z(objective)?;
    q.append(&state_prep.inverse()?, &all)?;

    // S0：|0…0> 取负号
    for &i in &all {
        q.x(i)?;
    }
    q.mcp(std::f64::consts::PI, &all[..n - 1], n - 1)?;
    for &i in &all {
        q.x(i)?;
    }

    q.append(state_prep, &all)?;
    Ok(q)
}

/// 目标比特为1的精确概率
pub fn exact_amplitude(state_prep: &Circuit, objective: usize, params: &[f64]) -> Result<f64> {
    let state = Simulator::new().statevector(state_prep, params)?;
    Ok(state.probability_of_one(objective))
}

#[derive(Debug, Clone, Serialize)]
pub struct AmplitudeEstimate {
    pub estimation: f64,
    pub confidence_interval: (f64, f64),
    /// a = sin²θ
    pub theta: f64,
    pub oracle_queries: u64,
    /// 每个幂次的采样次数
    pub shots: u64,
    /// 各幂次的命中次数
    pub hits: BTreeMap<usize, u64>,
}

#[derive(Debug, Clone)]
pub struct MaximumLikelihoodAe {
    pub evaluation_powers: Vec<usize>,
    pub shots: u64,
    pub confidence_level: f64,
    simulator: Simulator,
}

impl MaximumLikelihoodAe {
    pub fn new(evaluation_powers: Vec<usize>, shots: u64, confidence_level: f64) -> Result<Self> {
        if evaluation_powers.is_empty() {
            return Err(QhmmError::invalid("at least one evaluation power is required"));
        }
        if shots == 0 {
            return Err(QhmmError::invalid("shots must be positive"));
        }
        if !(confidence_level > 0.0 && confidence_level < 1.0) {
            return Err(QhmmError::invalid(format!(
                "confidence level must be in (0, 1), got {}",
                confidence_level
            )));
        }
        Ok(Self {
            evaluation_powers,
            shots,
            confidence_level,
            simulator: Simulator::new(),
        })
    }

    /// 按 1, 2, 4, … 的指数幂次
    pub fn exponential(num_powers: usize, shots: u64, confidence_level: f64) -> Result<Self> {
        let mut powers = vec![0];
        powers.extend((0..num_powers.saturating_sub(1)).map(|i| 1usize << i));
        Self::new(powers, shots, confidence_level)
    }

    /// 每个幂次下目标比特为1的精确概率
    fn good_state_probabilities(&self, state_prep: &Circuit, objective: usize) -> Result<BTreeMap<usize, f64>> {
        let grover = grover_operator(state_prep, objective)?;
        let max_power = self.evaluation_powers.iter().copied().max().unwrap_or(0);

        let mut state = self.simulator.statevector(state_prep, &[])?;
        let mut probabilities = BTreeMap::new();
        for k in 0..=max_power {
            if k > 0 {
                state = self.simulator.evolve(&grover, &[], state)?;
            }
            if self.evaluation_powers.contains(&k) {
                probabilities.insert(k, state.probability_of_one(objective));
            }
        }
        Ok(probabilities)
    }

    fn log_likelihood(theta: f64, hits: &BTreeMap<usize, u64>, shots: u64) -> f64 {
        hits.iter()
            .map(|(&k, &h)| {
                let angle = (2 * k + 1) as f64 * theta;
                let p1 = angle.sin().powi(2);
                let p0 = angle.cos().powi(2);
                let mut ll = 0.0;
                if h > 0 {
                    ll += h as f64 * p1.max(LOG_FLOOR).ln();
                }
                if shots > h {
                    ll += (shots - h) as f64 * p0.max(LOG_FLOOR).ln();
                }
                ll
            })
            .sum()
    }

    /// 网格搜索后用黄金分割细化
    fn maximize(&self, hits: &BTreeMap<usize, u64>) -> f64 {
        let max_power = hits.keys().copied().max().unwrap_or(0);
        let grid = (100 * (2 * max_power + 1)).max(1000);
        let step = FRAC_PI_2 / grid as f64;

        let mut best = 0.0;
        let mut best_ll = f64::NEG_INFINITY;
        for i in 0..=grid {
            let theta = i as f64 * step;
            let ll = Self::log_likelihood(theta, hits, self.shots);
            if ll > best_ll {
                best_ll = ll;
                best = theta;
            }
        }

        let ratio = (5f64.sqrt() - 1.0) / 2.0;
        let mut lo = (best - step).max(0.0);
        let mut hi = (best + step).min(FRAC_PI_2);
        for _ in 0..100 {
            let x1 = hi - ratio * (hi - lo);
            let x2 = lo + ratio * (hi - lo);
            if Self::log_likelihood(x1, hits, self.shots) < Self::log_likelihood(x2, hits, self.shots) {
                lo = x1;
            } else {
                hi = x2;
            }
            if hi - lo < 1e-12 {
                break;
            }
        }
        let refined = 0.5 * (lo + hi);
        if Self::log_likelihood(refined, hits, self.shots) >= best_ll {
            refined
        } else {
            best
        }
    }

    /// 估计 `state_prep`（已绑定参数）中 `objective` 为1的概率
    pub fn estimate<R: Rng + ?Sized>(
        &self,
        state_prep: &Circuit,
        objective: usize,
        rng: &mut R,
    ) -> Result<AmplitudeEstimate> {
        let probabilities = self.good_state_probabilities(state_prep, objective)?;

        let mut hits = BTreeMap::new();
        for (&k, &p) in &probabilities {
            let binomial = Binomial::new(self.shots, p.clamp(0.0, 1.0))
                .map_err(|e| QhmmError::invalid(format!("hit distribution for power {}: {}", k, e)))?;
            let h = binomial.sample(rng);
            debug!("power {}: {}/{} good outcomes (p = {:.6})", k, h, self.shots, p);
            hits.insert(k, h);
        }

        let theta = self.maximize(&hits);
        let estimation = theta.sin().powi(2);

        let fisher: f64 = hits
            .keys()
            .map(|&k| 4.0 * self.shots as f64 * ((2 * k + 1) as f64).powi(2))
            .sum();
        let z = Normal::new(0.0, 1.0)
            .map_err(|e| QhmmError::invalid(e.to_string()))?
            .inverse_cdf(1.0 - (1.0 - self.confidence_level) / 2.0);
        let half_width = z * (2.0 * theta).sin().abs() / fisher.sqrt();
        let confidence_interval = ((estimation - half_width).max(0.0), (estimation + half_width).min(1.0));

        let oracle_queries: u64 = hits.keys().map(|&k| k as u64 * self.shots).sum();
        info!(
            "MLAE: a = {:.6} in [{:.6}, {:.6}] with {} oracle queries",
            estimation, confidence_interval.0, confidence_interval.1, oracle_queries
        );

        Ok(AmplitudeEstimate {
            estimation,
            confidence_interval,
            theta,
            oracle_queries,
            shots: self.shots,
            hits,
        })
    }
}
