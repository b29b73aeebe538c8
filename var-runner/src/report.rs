use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use uuid::Uuid;

use common::config::RunConfig;
use qhmm_model::{AmplitudeEstimate, TrainingReport, VarResult};

/// 同一亏损阈值下各方法给出的亏损概率
#[derive(Debug, Clone, Serialize)]
pub struct LossProbabilities {
    pub loss_threshold: f64,
    pub classical_exact: f64,
    pub classical_monte_carlo: f64,
    /// 训练后 QHMM 线路的精确振幅
    pub qhmm_exact: f64,
    pub qae: AmplitudeEstimate,
}

#[derive(Debug, Clone, Serialize)]
pub struct VarSummary {
    pub confidence: f64,
    pub confidence_pct: Decimal,
    pub classical: VarResult,
    pub quantum: Option<VarResult>,
    /// 按组合市值换算的 VaR 金额
    pub classical_amount: Decimal,
    pub quantum_amount: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub config: RunConfig,
    pub training: TrainingReport,
    pub probabilities: LossProbabilities,
    pub var: VarSummary,
}

/// 对数收益阈值换算成金额：V·(1 - e^threshold)
pub fn var_amount(portfolio_value: f64, loss_threshold: f64) -> Decimal {
    let amount = portfolio_value * (1.0 - loss_threshold.exp());
    Decimal::from_f64(amount).unwrap_or(Decimal::ZERO).round_dp(2)
}

impl VarSummary {
    pub fn new(config: &RunConfig, classical: VarResult, quantum: Option<VarResult>) -> Self {
        let value = config.portfolio.portfolio_value;
        let confidence = config.portfolio.confidence;
        Self {
            confidence,
            confidence_pct: Decimal::from_f64(confidence).unwrap_or(Decimal::ZERO) * dec!(100),
            classical_amount: var_amount(value, classical.loss_threshold),
            quantum_amount: quantum.as_ref().map(|q| var_amount(value, q.loss_threshold)),
            classical,
            quantum,
        }
    }
}

impl RunReport {
    pub fn new(
        config: RunConfig,
        training: TrainingReport,
        probabilities: LossProbabilities,
        var: VarSummary,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            config,
            training,
            probabilities,
            var,
        }
    }

    pub async fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write run report: {:?}", path))
    }
}
