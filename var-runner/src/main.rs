use std::path::Path;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use common::config::RunConfig;
use qhmm_model::{
    classical_var, exact_loss_probability, hidden_superposition, value_at_risk, AmplitudeEstimate, ClassicalHmm,
    ExactClassical, LossProbability, MaximumLikelihoodAe, QhmmBuilder, QhmmTrainer, QuantumEstimator, TrainableQhmm,
    TrainerConfig,
};

mod report;

use report::{LossProbabilities, RunReport, VarSummary};

const DEFAULT_CONFIG_PATH: &str = "config/var.toml";

/// 二分搜索的精度与最大迭代次数
const SEARCH_TOLERANCE: f64 = 1e-4;
const SEARCH_MAX_ITERATIONS: usize = 40;

fn load_config() -> Result<RunConfig> {
    if let Some(path) = std::env::args().nth(1) {
        info!("Loading run config from {}", path);
        return RunConfig::load(&path);
    }
    if Path::new(DEFAULT_CONFIG_PATH).exists() {
        info!("Loading run config from {}", DEFAULT_CONFIG_PATH);
        return RunConfig::load(DEFAULT_CONFIG_PATH);
    }
    warn!("No config file found, using built-in defaults");
    let config = RunConfig::default();
    config.validate()?;
    Ok(config)
}

fn build_qhmm(config: &RunConfig, hmm: &ClassicalHmm) -> Result<TrainableQhmm> {
    let qhmm_config = &config.qhmm;
    if qhmm_config.measurement_qubits.len() != hmm.emission_bits() {
        anyhow::bail!(
            "{} measurement qubits cannot encode {} emission outcomes ({} bits)",
            qhmm_config.measurement_qubits.len(),
            hmm.num_outcomes(),
            hmm.emission_bits()
        );
    }
    // 振幅估计需要幺正初态
    let initial_state = hidden_superposition(qhmm_config.num_qubits, &qhmm_config.measurement_qubits)?;
    let qhmm = QhmmBuilder::from_config(qhmm_config)?
        .initial_state(initial_state)
        .num_time_steps(config.portfolio.num_time_steps)
        .build()?;
    Ok(qhmm)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting QHMM VaR run");

    let config = load_config()?;
    let portfolio = config.portfolio.clone();
    let estimation = config.estimation.clone();
    let seed = config.training.seed;

    let hmm = ClassicalHmm::new(
        config.hmm.transition.clone(),
        config.hmm.emission.clone(),
        config.hmm.initial.clone(),
    )
    .context("Invalid regime HMM")?;
    info!(
        "Regime HMM: {} states, {} outcomes, stationary {:?}",
        hmm.num_states(),
        hmm.num_outcomes(),
        hmm.stationary_distribution()
    );

    let qhmm = build_qhmm(&config, &hmm)?;
    info!(
        "QHMM ansatz: {} qubits, gates {:?}, {} entanglement, {} parameters",
        qhmm.num_qubits(),
        config.qhmm.su2_gates,
        config.qhmm.entanglement,
        qhmm.num_parameters()
    );

    // 训练
    let target = hmm.exact_distribution(portfolio.num_time_steps)?;
    let trainer_config = TrainerConfig::from_config(&config.training)?;
    let training = {
        let qhmm = qhmm.clone();
        tokio::task::spawn_blocking(move || QhmmTrainer::new(&qhmm, trainer_config).fit(&target, None))
            .await
            .context("Training task panicked")??
    };
    let params = training.parameters.clone();

    // 同一阈值下三种估计并行
    let loss = portfolio.loss;
    let monte_carlo = {
        let hmm = hmm.clone();
        let growths = portfolio.growths.clone();
        let steps = portfolio.num_time_steps;
        let samples = estimation.classical_samples;
        tokio::task::spawn_blocking(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            classical_var(&hmm, steps, samples, &growths, loss, &mut rng)
        })
    };
    let exact = {
        let hmm = hmm.clone();
        let growths = portfolio.growths.clone();
        let steps = portfolio.num_time_steps;
        tokio::task::spawn_blocking(move || exact_loss_probability(&hmm, steps, &growths, loss))
    };
    let quantum = {
        let qhmm = qhmm.clone();
        let params = params.clone();
        let growths = portfolio.growths.clone();
        let num_val_qubits = portfolio.num_val_qubits;
        let estimation = estimation.clone();
        tokio::task::spawn_blocking(move || -> common::Result<(f64, AmplitudeEstimate)> {
            let mut exact = QuantumEstimator::new(&qhmm, params.clone(), growths.clone(), num_val_qubits)?;
            let amplitude = exact.loss_probability(loss)?;
            let mlae = MaximumLikelihoodAe::new(
                estimation.evaluation_powers,
                estimation.shots,
                estimation.confidence_level,
            )?;
            let mut estimated = QuantumEstimator::new(&qhmm, params, growths, num_val_qubits)?
                .with_amplitude_estimation(mlae, seed);
            estimated.loss_probability(loss)?;
            let estimate = estimated
                .last_estimate()
                .cloned()
                .ok_or_else(|| common::error::QhmmError::invalid("amplitude estimation produced no result"))?;
            Ok((amplitude, estimate))
        })
    };
    let (monte_carlo, exact, quantum) = tokio::try_join!(monte_carlo, exact, quantum)
        .context("Estimation task panicked")?;
    let (classical_monte_carlo, classical_exact) = (monte_carlo?, exact?);
    let (qhmm_exact, qae) = quantum?;
    info!(
        "P(total growth < {}): exact {:.6}, monte carlo {:.6}, qhmm {:.6}, qae {:.6}",
        loss, classical_exact, classical_monte_carlo, qhmm_exact, qae.estimation
    );

    // VaR 阈值搜索
    let steps = portfolio.num_time_steps as f64;
    let max_growth = portfolio.growths.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min_growth = portfolio.growths.iter().cloned().fold(f64::INFINITY, f64::min);
    let margin = (max_growth - min_growth).max(f64::EPSILON);
    let (lower, upper) = (steps * min_growth - margin, steps * max_growth + margin);

    let mut exact_search = ExactClassical::new(&hmm, portfolio.num_time_steps, portfolio.growths.clone());
    let classical_result = value_at_risk(
        &mut exact_search,
        portfolio.confidence,
        lower,
        upper,
        SEARCH_TOLERANCE,
        SEARCH_MAX_ITERATIONS,
    )?;

    let mlae = MaximumLikelihoodAe::new(
        estimation.evaluation_powers.clone(),
        estimation.shots,
        estimation.confidence_level,
    )?;
    let mut quantum_search =
        QuantumEstimator::new(&qhmm, params, portfolio.growths.clone(), portfolio.num_val_qubits)?
            .with_amplitude_estimation(mlae, seed);
    let quantum_result = match value_at_risk(
        &mut quantum_search,
        portfolio.confidence,
        lower,
        upper,
        SEARCH_TOLERANCE,
        SEARCH_MAX_ITERATIONS,
    ) {
        Ok(result) => Some(result),
        Err(e) => {
            warn!("Quantum VaR search failed: {}", e);
            None
        }
    };

    let var = VarSummary::new(&config, classical_result, quantum_result);
    info!(
        "VaR({}%): classical {} / quantum {:?}",
        var.confidence_pct, var.classical_amount, var.quantum_amount
    );

    let probabilities = LossProbabilities {
        loss_threshold: loss,
        classical_exact,
        classical_monte_carlo,
        qhmm_exact,
        qae,
    };
    let report_path = config.output.report_path.clone();
    let report = RunReport::new(config, training, probabilities, var);
    report.write(&report_path).await?;
    info!("Run {} written to {}", report.run_id, report_path);

    Ok(())
}
