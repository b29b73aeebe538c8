use std::collections::BTreeMap;
use rand::distributions::{Distribution, WeightedIndex};
use rand::RngCore;
use tracing::debug;

use common::bits::{encode_sequence, num_bits_for};
use common::error::{QhmmError, Result};

/// 行随机矩阵的容差
const STOCHASTIC_TOLERANCE: f64 = 1e-8;

/// 枚举精确分布时允许的最大序列数
const MAX_ENUMERATED_SEQUENCES: usize = 1 << 22;

/// 能按时间步产生发射序列的模型
pub trait EmissionSampler {
    fn sample_emissions(&self, num_time_steps: usize, rng: &mut dyn RngCore) -> Vec<usize>;
}

/// 经典隐马尔可夫模型（离散发射）
#[derive(Debug, Clone)]
pub struct ClassicalHmm {
    transition: Vec<Vec<f64>>,
    emission: Vec<Vec<f64>>,
    initial: Vec<f64>,
    initial_sampler: WeightedIndex<f64>,
    transition_samplers: Vec<WeightedIndex<f64>>,
    emission_samplers: Vec<WeightedIndex<f64>>,
}

fn check_row(matrix: &'static str, row: usize, values: &[f64]) -> Result<()> {
    if values.iter().any(|v| *v < 0.0 || !v.is_finite()) {
        return Err(QhmmError::invalid(format!(
            "row {} of the {} matrix has a negative or non-finite entry",
            row, matrix
        )));
    }
    let sum: f64 = values.iter().sum();
    if (sum - 1.0).abs() > STOCHASTIC_TOLERANCE {
        return Err(QhmmError::NotStochastic { matrix, row, sum });
    }
    Ok(())
}

fn sampler(matrix: &'static str, row: usize, values: &[f64]) -> Result<WeightedIndex<f64>> {
    WeightedIndex::new(values)
        .map_err(|e| QhmmError::invalid(format!("row {} of the {} matrix: {}", row, matrix, e)))
}

impl ClassicalHmm {
    pub fn new(transition: Vec<Vec<f64>>, emission: Vec<Vec<f64>>, initial: Vec<f64>) -> Result<Self> {
        let num_states = initial.len();
        if num_states == 0 {
            return Err(QhmmError::invalid("HMM needs at least one hidden state"));
        }
        if transition.len() != num_states {
            return Err(QhmmError::DimensionMismatch {
                expected: num_states,
                actual: transition.len(),
                context: "transition matrix rows".to_string(),
            });
        }
        if emission.len() != num_states {
            return Err(QhmmError::DimensionMismatch {
                expected: num_states,
                actual: emission.len(),
                context: "emission matrix rows".to_string(),
            });
        }
        let num_outcomes = emission[0].len();
        if num_outcomes == 0 {
            return Err(QhmmError::invalid("HMM needs at least one outcome"));
        }

        check_row("initial", 0, &initial)?;
        for (i, row) in transition.iter().enumerate() {
            if row.len() != num_states {
                return Err(QhmmError::DimensionMismatch {
                    expected: num_states,
                    actual: row.len(),
                    context: format!("transition matrix row {}", i),
                });
            }
            check_row("transition", i, row)?;
        }
        for (i, row) in emission.iter().enumerate() {
            if row.len() != num_outcomes {
                return Err(QhmmError::DimensionMismatch {
                    expected: num_outcomes,
                    actual: row.len(),
                    context: format!("emission matrix row {}", i),
                });
            }
            check_row("emission", i, row)?;
        }

        let initial_sampler = sampler("initial", 0, &initial)?;
        let transition_samplers = transition
            .iter()
            .enumerate()
            .map(|(i, row)| sampler("transition", i, row))
            .collect::<Result<Vec<_>>>()?;
        let emission_samplers = emission
            .iter()
            .enumerate()
            .map(|(i, row)| sampler("emission", i, row))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            transition,
            emission,
            initial,
            initial_sampler,
            transition_samplers,
            emission_samplers,
        })
    }

    pub fn num_states(&self) -> usize {
        self.initial.len()
    }

    pub fn num_outcomes(&self) -> usize {
        self.emission[0].len()
    }

    pub fn transition(&self) -> &[Vec<f64>] {
        &self.transition
    }

    pub fn emission(&self) -> &[Vec<f64>] {
        &self.emission
    }

    pub fn initial(&self) -> &[f64] {
        &self.initial
    }

    /// 每个发射在比特串里占的位数（至少1位）
    pub fn emission_bits(&self) -> usize {
        num_bits_for(self.num_outcomes()).max(1)
    }

    /// 采样一条长度为T的序列，返回 (观测, 隐状态)
    pub fn sample(&self, num_time_steps: usize, rng: &mut dyn RngCore) -> (Vec<usize>, Vec<usize>) {
        let mut observations = Vec::with_capacity(num_time_steps);
        let mut states = Vec::with_capacity(num_time_steps);
        if num_time_steps == 0 {
            return (observations, states);
        }
        let mut state = self.initial_sampler.sample(rng);
        for t in 0..num_time_steps {
            if t > 0 {
                state = self.transition_samplers[state].sample(rng);
            }
            states.push(state);
            observations.push(self.emission_samplers[state].sample(rng));
        }
        (observations, states)
    }

    /// 采样 `num_samples` 条序列并统计各发射比特串的出现次数
    pub fn generate_distribution(
        &self,
        num_time_steps: usize,
        num_samples: usize,
        rng: &mut dyn RngCore,
    ) -> Result<BTreeMap<String, u64>> {
        let bits = self.emission_bits();
        let mut counts = BTreeMap::new();
        for _ in 0..num_samples {
            let (observations, _) = self.sample(num_time_steps, rng);
            *counts.entry(encode_sequence(&observations, bits)?).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// 枚举所有发射序列的精确概率（前向算法）
    pub fn exact_distribution(&self, num_time_steps: usize) -> Result<BTreeMap<String, f64>> {
        let outcomes = self.num_outcomes();
        let total = (outcomes as f64).powi(num_time_steps as i32);
        if total > MAX_ENUMERATED_SEQUENCES as f64 {
            return Err(QhmmError::invalid(format!(
                "{} outcomes over {} steps is too many sequences to enumerate",
                outcomes, num_time_steps
            )));
        }
        let bits = self.emission_bits();
        let mut dist = BTreeMap::new();
        let mut sequence = Vec::with_capacity(num_time_steps);
        let mut failure = None;
        self.enumerate(&self.initial, num_time_steps, &mut sequence, &mut |seq: &[usize], p: f64| {
            match encode_sequence(seq, bits) {
                Ok(key) => {
                    dist.insert(key, p);
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        debug!("Enumerated {} emission sequences over {} steps", dist.len(), num_time_steps);
        Ok(dist)
    }

    /// `predicted` 是当前时间步隐状态的（未归一化）分布
    fn enumerate(
        &self,
        predicted: &[f64],
        remaining: usize,
        sequence: &mut Vec<usize>,
        visit: &mut dyn FnMut(&[usize], f64),
    ) {
        if remaining == 0 {
            visit(sequence, predicted.iter().sum());
            return;
        }
        for o in 0..self.num_outcomes() {
            let filtered: Vec<f64> = predicted
                .iter()
                .enumerate()
                .map(|(s, p)| p * self.emission[s][o])
                .collect();
            if filtered.iter().sum::<f64>() <= 0.0 {
                continue;
            }
            sequence.push(o);
            if remaining == 1 {
                visit(sequence, filtered.iter().sum());
            } else {
                let next = self.propagate(&filtered);
                self.enumerate(&next, remaining - 1, sequence, visit);
            }
            sequence.pop();
        }
    }

    fn propagate(&self, alpha: &[f64]) -> Vec<f64> {
        let n = self.num_states();
        (0..n)
            .map(|j| (0..n).map(|i| alpha[i] * self.transition[i][j]).sum())
            .collect()
    }

    /// 观测序列的似然（前向算法）
    pub fn likelihood(&self, observations: &[usize]) -> Result<f64> {
        if let Some(&o) = observations.iter().find(|&&o| o >= self.num_outcomes()) {
            return Err(QhmmError::invalid(format!("observation {} out of range", o)));
        }
        let mut alpha = self.initial.clone();
        for (t, &o) in observations.iter().enumerate() {
            if t > 0 {
                alpha = self.propagate(&alpha);
            }
            for (s, a) in alpha.iter_mut().enumerate() {
                *a *= self.emission[s][o];
            }
        }
        Ok(alpha.iter().sum())
    }

    /// 平稳分布（幂迭代）
    pub fn stationary_distribution(&self) -> Vec<f64> {
        let n = self.num_states();
        let mut pi = vec![1.0 / n as f64; n];
        for _ in 0..10_000 {
            let next = self.propagate(&pi);
            let diff: f64 = next.iter().zip(pi.iter()).map(|(a, b)| (a - b).abs()).sum();
            pi = next;
            if diff < 1e-13 {
                break;
            }
        }
        pi
    }
}

impl EmissionSampler for ClassicalHmm {
    fn sample_emissions(&self, num_time_steps: usize, rng: &mut dyn RngCore) -> Vec<usize> {
        self.sample(num_time_steps, rng).0
    }
}
