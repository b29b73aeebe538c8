use std::fs;
use std::path::Path;
use serde::{Deserialize, Serialize};
use anyhow::{Context, Result};

/// 隐马尔可夫状态模型配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HmmConfig {
    /// 状态转移矩阵 (S x S)
    pub transition: Vec<Vec<f64>>,
    /// 发射矩阵 (S x O)
    pub emission: Vec<Vec<f64>>,
    /// 初始状态分布 (S)
    pub initial: Vec<f64>,
}

/// 组合配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortfolioConfig {
    /// 每种发射对应的单期对数收益
    pub growths: Vec<f64>,
    /// 亏损阈值（对数收益）
    pub loss: f64,
    pub num_time_steps: usize,
    /// 价值寄存器的量子比特数
    pub num_val_qubits: usize,
    /// 组合市值，用于把VaR换算成金额
    pub portfolio_value: f64,
    /// VaR置信度，例如 0.95
    pub confidence: f64,
}

/// QHMM 电路结构配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QhmmConfig {
    pub num_qubits: usize,
    pub su2_gates: Vec<String>,
    pub entanglement: String,
    pub reps: usize,
    /// 每个时间步测量的量子比特
    pub measurement_qubits: Vec<usize>,
}

/// 训练配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainingConfig {
    /// "adam" 或 "gradient_descent"
    pub optimizer: String,
    /// "kl" 或 "tv"
    pub loss: String,
    pub learning_rate: f64,
    pub max_epochs: usize,
    pub epsilon: f64,
    pub tolerance: f64,
    pub patience: usize,
    pub seed: u64,
}

/// 振幅估计配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EstimationConfig {
    /// Grover算子的幂次
    pub evaluation_powers: Vec<usize>,
    pub shots: u64,
    pub confidence_level: f64,
    /// 经典蒙特卡洛样本数
    pub classical_samples: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    pub report_path: String,
}

/// 运行配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    pub hmm: HmmConfig,
    pub portfolio: PortfolioConfig,
    pub qhmm: QhmmConfig,
    pub training: TrainingConfig,
    pub estimation: EstimationConfig,
    pub output: OutputConfig,
}

impl RunConfig {
    /// 从配置文件加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read run config: {:?}", path))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse run config: {:?}", path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 检查各项取值范围
    pub fn validate(&self) -> Result<()> {
        let p = &self.portfolio;
        if p.growths.is_empty() {
            anyhow::bail!("portfolio.growths must not be empty");
        }
        if p.growths.len() != self.hmm.emission.first().map(|r| r.len()).unwrap_or(0) {
            anyhow::bail!(
                "portfolio.growths has {} entries but the emission matrix has {} outcomes",
                p.growths.len(),
                self.hmm.emission.first().map(|r| r.len()).unwrap_or(0)
            );
        }
        if p.num_time_steps == 0 {
            anyhow::bail!("portfolio.num_time_steps must be positive");
        }
        if p.num_val_qubits < 2 {
            anyhow::bail!("portfolio.num_val_qubits must be at least 2");
        }
        if !(0.0..1.0).contains(&p.confidence) {
            anyhow::bail!("portfolio.confidence must be in [0, 1), got {}", p.confidence);
        }
        if p.portfolio_value <= 0.0 {
            anyhow::bail!("portfolio.portfolio_value must be positive");
        }
        if self.qhmm.num_qubits == 0 || self.qhmm.measurement_qubits.is_empty() {
            anyhow::bail!("qhmm needs qubits and at least one measurement qubit");
        }
        if let Some(&q) = self.qhmm.measurement_qubits.iter().find(|&&q| q >= self.qhmm.num_qubits) {
            anyhow::bail!("measurement qubit {} out of range", q);
        }
        let t = &self.training;
        if t.learning_rate <= 0.0 || t.epsilon <= 0.0 {
            anyhow::bail!("training.learning_rate and training.epsilon must be positive");
        }
        let e = &self.estimation;
        if e.evaluation_powers.is_empty() || e.shots == 0 {
            anyhow::bail!("estimation needs evaluation powers and a positive shot count");
        }
        if !(0.0..1.0).contains(&e.confidence_level) || e.confidence_level == 0.0 {
            anyhow::bail!("estimation.confidence_level must be in (0, 1)");
        }
        if e.classical_samples == 0 {
            anyhow::bail!("estimation.classical_samples must be positive");
        }
        Ok(())
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            hmm: HmmConfig {
                transition: vec![vec![0.7, 0.3], vec![0.4, 0.6]],
                emission: vec![vec![0.9, 0.1], vec![0.2, 0.8]],
                initial: vec![0.6, 0.4],
            },
            portfolio: PortfolioConfig {
                growths: vec![0.0, 0.25],
                loss: 0.375,
                num_time_steps: 4,
                num_val_qubits: 4,
                portfolio_value: 1_000_000.0,
                confidence: 0.95,
            },
            qhmm: QhmmConfig {
                num_qubits: 2,
                su2_gates: vec!["ry".to_string()],
                entanglement: "linear".to_string(),
                reps: 3,
                measurement_qubits: vec![1],
            },
            training: TrainingConfig {
                optimizer: "adam".to_string(),
                loss: "kl".to_string(),
                learning_rate: 0.1,
                max_epochs: 200,
                epsilon: 1e-4,
                tolerance: 1e-7,
                patience: 10,
                seed: 7,
            },
            estimation: EstimationConfig {
                evaluation_powers: vec![0, 1, 2, 4],
                shots: 200,
                confidence_level: 0.95,
                classical_samples: 20_000,
            },
            output: OutputConfig {
                report_path: "var_report.json".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let content = toml::to_string(&RunConfig::default()).unwrap();
        let config = RunConfig::from_toml_str(&content).unwrap();
        assert_eq!(config.portfolio.num_time_steps, 4);
        assert_eq!(config.qhmm.measurement_qubits, vec![1]);
        assert_eq!(config.estimation.evaluation_powers, vec![0, 1, 2, 4]);
    }

    #[test]
    fn test_rejects_growth_outcome_mismatch() {
        let mut config = RunConfig::default();
        config.portfolio.growths = vec![0.0, 0.1, 0.2];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_measurement_out_of_range() {
        let mut config = RunConfig::default();
        config.qhmm.measurement_qubits = vec![2];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shipped_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../config/var.toml");
        let config = RunConfig::load(path).unwrap();
        assert_eq!(config.portfolio.growths, vec![0.0, 0.25]);
        assert_eq!(config.training.optimizer, "adam");
    }
}
