use rand::RngCore;
use tracing::debug;

use common::bits::decode_sequence;
use common::error::{QhmmError, Result};
use crate::hmm::{ClassicalHmm, EmissionSampler};

/// 一条发射序列的总增长
fn total_growth(emissions: &[usize], growths: &[f64]) -> Result<f64> {
    emissions.iter().try_fold(0.0, |acc, &e| {
        growths
            .get(e)
            .map(|g| acc + g)
            .ok_or_else(|| QhmmError::invalid(format!(
                "emission {} has no growth (only {} growths)",
                e,
                growths.len()
            )))
    })
}

/// 蒙特卡洛估计总增长低于 `loss` 的概率
pub fn classical_var(
    sampler: &dyn EmissionSampler,
    num_time_steps: usize,
    num_samples: usize,
    growths: &[f64],
    loss: f64,
    rng: &mut dyn RngCore,
) -> Result<f64> {
    if num_samples == 0 {
        return Err(QhmmError::invalid("num_samples must be positive"));
    }
    let mut loss_samples = 0usize;
    for _ in 0..num_samples {
        let emissions = sampler.sample_emissions(num_time_steps, rng);
        if total_growth(&emissions, growths)? < loss {
            loss_samples += 1;
        }
    }
    let probability = loss_samples as f64 / num_samples as f64;
    debug!("Classical VaR: {}/{} samples below loss {}", loss_samples, num_samples, loss);
    Ok(probability)
}

/// 精确枚举总增长低于 `loss` 的概率
pub fn exact_loss_probability(
    hmm: &ClassicalHmm,
    num_time_steps: usize,
    growths: &[f64],
    loss: f64,
) -> Result<f64> {
    let bits = hmm.emission_bits();
    let mut probability = 0.0;
    for (key, p) in hmm.exact_distribution(num_time_steps)? {
        let emissions = decode_sequence(&key, bits)?;
        if total_growth(&emissions, growths)? < loss {
            probability += p;
        }
    }
    Ok(probability)
}
