use std::collections::BTreeMap;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::debug;

use common::bits::register_to_key;
use common::error::{QhmmError, Result};
use crate::circuit::{Circuit, Instruction};
use crate::gate::Matrix2;
use crate::statevector::Statevector;

/// 编译后的指令：门矩阵已求值，控制位已转为掩码
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Gate {
        matrix: Matrix2,
        target: usize,
        ctrl_mask: usize,
        ctrl_value: usize,
    },
    Measure { qubit: usize, clbit: usize },
    Reset { qubit: usize },
}

pub(crate) fn compile(circuit: &Circuit, params: &[f64]) -> Result<Vec<Step>> {
    if params.len() < circuit.num_parameters() {
        return Err(QhmmError::DimensionMismatch {
            expected: circuit.num_parameters(),
            actual: params.len(),
            context: format!("parameter values for '{}'", circuit.name()),
        });
    }
    let mut steps = Vec::with_capacity(circuit.instructions().len());
    for inst in circuit.instructions() {
        match inst {
            Instruction::Unitary { gate, target, controls, ctrl_state } => {
                let mut ctrl_mask = 0usize;
                let mut ctrl_value = 0usize;
                for (j, &c) in controls.iter().enumerate() {
                    ctrl_mask |= 1 << c;
                    if (ctrl_state >> j) & 1 == 1 {
                        ctrl_value |= 1 << c;
                    }
                }
                steps.push(Step::Gate {
                    matrix: gate.matrix(params)?,
                    target: *target,
                    ctrl_mask,
                    ctrl_value,
                });
            }
            Instruction::Measure { qubit, clbit } => {
                steps.push(Step::Measure { qubit: *qubit, clbit: *clbit })
            }
            Instruction::Reset { qubit } => steps.push(Step::Reset { qubit: *qubit }),
            Instruction::Barrier => {}
        }
    }
    Ok(steps)
}

/// 单个测量分支
struct Branch {
    probability: f64,
    state: Statevector,
    clbits: u64,
}

/// 精确态矢量模拟器
///
/// 中间测量与重置通过分支展开处理，因此得到的经典分布是精确的，
/// 采样只在最后一步进行。
#[derive(Debug, Clone)]
pub struct Simulator {
    /// 概率低于该阈值的分支被丢弃
    prune_threshold: f64,
    max_qubits: usize,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        Self {
            prune_threshold: 1e-14,
            max_qubits: 24,
        }
    }

    fn check_width(&self, circuit: &Circuit) -> Result<()> {
        if circuit.num_qubits() > self.max_qubits {
            return Err(QhmmError::invalid(format!(
                "{} qubits exceeds the simulator limit of {}",
                circuit.num_qubits(),
                self.max_qubits
            )));
        }
        if circuit.num_clbits() > 64 {
            return Err(QhmmError::invalid("at most 64 classical bits are supported"));
        }
        Ok(())
    }

    /// 幺正线路的末态
    pub fn statevector(&self, circuit: &Circuit, params: &[f64]) -> Result<Statevector> {
        self.evolve(circuit, params, Statevector::zero(circuit.num_qubits()))
    }

    /// 从给定初态演化（幺正线路）
    pub fn evolve(&self, circuit: &Circuit, params: &[f64], initial: Statevector) -> Result<Statevector> {
        self.check_width(circuit)?;
        if !circuit.is_unitary() {
            return Err(QhmmError::NonUnitary(format!(
                "'{}' contains measurements or resets; use distribution()",
                circuit.name()
            )));
        }
        if initial.num_qubits() != circuit.num_qubits() {
            return Err(QhmmError::DimensionMismatch {
                expected: circuit.num_qubits(),
                actual: initial.num_qubits(),
                context: "initial state width".to_string(),
            });
        }
        let steps = compile(circuit, params)?;
        let mut state = initial;
        run_unitary_steps(&steps, &mut state);
        Ok(state)
    }

    /// 经典寄存器的精确分布，键为比特串（第0个经典比特在最右）
    pub fn distribution(&self, circuit: &Circuit, params: &[f64]) -> Result<BTreeMap<String, f64>> {
        self.check_width(circuit)?;
        let steps = compile(circuit, params)?;
        let mut branches = vec![Branch {
            probability: 1.0,
            state: Statevector::zero(circuit.num_qubits()),
            clbits: 0,
        }];

        for step in &steps {
            match step {
                Step::Gate { matrix, target, ctrl_mask, ctrl_value } => {
                    for branch in branches.iter_mut() {
                        branch.state.apply(matrix, *target, *ctrl_mask, *ctrl_value);
                    }
                }
                Step::Measure { qubit, clbit } => {
                    branches = self.split(branches, *qubit, |branch, outcome| {
                        if outcome {
                            branch.clbits |= 1u64 << *clbit;
                        } else {
                            branch.clbits &= !(1u64 << *clbit);
                        }
                    });
                }
                Step::Reset { qubit } => {
                    branches = self.split(branches, *qubit, |branch, outcome| {
                        if outcome {
                            branch.state.flip(*qubit);
                        }
                    });
                }
            }
        }
        debug!("'{}' finished with {} branches", circuit.name(), branches.len());

        let mut dist = BTreeMap::new();
        for branch in branches {
            *dist
                .entry(register_to_key(branch.clbits, circuit.num_clbits()))
                .or_insert(0.0) += branch.probability;
        }
        Ok(dist)
    }

    fn split(
        &self,
        branches: Vec<Branch>,
        qubit: usize,
        on_outcome: impl Fn(&mut Branch, bool),
    ) -> Vec<Branch> {
        let mut next = Vec::with_capacity(branches.len() * 2);
        for branch in branches {
            let p1 = branch.state.probability_of_one(qubit);
            let p0 = 1.0 - p1;
            if p1 * branch.probability > self.prune_threshold {
                let mut one = Branch {
                    probability: branch.probability * p1,
                    state: branch.state.clone(),
                    clbits: branch.clbits,
                };
                one.state.collapse(qubit, true);
                on_outcome(&mut one, true);
                next.push(one);
            }
            if p0 * branch.probability > self.prune_threshold {
                let mut zero = Branch {
                    probability: branch.probability * p0,
                    state: branch.state,
                    clbits: branch.clbits,
                };
                zero.state.collapse(qubit, false);
                on_outcome(&mut zero, false);
                next.push(zero);
            }
        }
        next
    }

    /// 按精确分布采样 `shots` 次
    pub fn sample_counts<R: Rng + ?Sized>(
        &self,
        circuit: &Circuit,
        params: &[f64],
        shots: u64,
        rng: &mut R,
    ) -> Result<BTreeMap<String, u64>> {
        let dist = self.distribution(circuit, params)?;
        sample_from_distribution(&dist, shots, rng)
    }
}

pub(crate) fn run_unitary_steps(steps: &[Step], state: &mut Statevector) {
    for step in steps {
        if let Step::Gate { matrix, target, ctrl_mask, ctrl_value } = step {
            state.apply(matrix, *target, *ctrl_mask, *ctrl_value);
        }
    }
}

/// 从离散分布采样计数
pub fn sample_from_distribution<R: Rng + ?Sized>(
    dist: &BTreeMap<String, f64>,
    shots: u64,
    rng: &mut R,
) -> Result<BTreeMap<String, u64>> {
    let mut counts = BTreeMap::new();
    if dist.is_empty() {
        return Ok(counts);
    }
    let keys: Vec<&String> = dist.keys().collect();
    let index = WeightedIndex::new(dist.values())
        .map_err(|e| QhmmError::invalid(format!("cannot sample distribution: {}", e)))?;
    for _ in 0..shots {
        *counts.entry(keys[index.sample(rng)].clone()).or_insert(0) += 1;
    }
    Ok(counts)
}
