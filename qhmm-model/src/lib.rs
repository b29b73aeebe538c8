//! 量子隐马尔可夫模型与基于振幅估计的 VaR
//!
//! 经典 HMM 描述收益状态的切换；可训练 QHMM 学习其发射分布，
//! 再与 VaR 线路拼接后交给振幅估计读出亏损概率。

pub mod amplitude_estimation;
pub mod classical_var;
pub mod hmm;
pub mod qhmm;
pub mod training;
pub mod var_circuit;
pub mod var_search;

pub use amplitude_estimation::{exact_amplitude, grover_operator, AmplitudeEstimate, MaximumLikelihoodAe};
pub use classical_var::{classical_var, exact_loss_probability};
pub use hmm::{ClassicalHmm, EmissionSampler};
pub use qhmm::{default_initial_state, hidden_superposition, QhmmBuilder, StatePrep, TrainableQhmm};
pub use training::{normalize_counts, LossFunction, Optimizer, QhmmTrainer, TrainerConfig, TrainingReport};
pub use var_circuit::{var_circuit, VarCircuit};
pub use var_search::{value_at_risk, ExactClassical, LossProbability, MonteCarlo, QuantumEstimator, VarResult};
