use std::collections::BTreeMap;
use std::fmt;

use common::error::{QhmmError, Result};
use crate::gate::Gate;
use crate::param::Param;

/// 线路指令
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// 带控制位的单比特门；`ctrl_state` 第j位是第j个控制位要求的取值
    Unitary {
        gate: Gate,
        target: usize,
        controls: Vec<usize>,
        ctrl_state: u64,
    },
    Measure { qubit: usize, clbit: usize },
    Reset { qubit: usize },
    Barrier,
}

impl Instruction {
    pub fn is_unitary(&self) -> bool {
        !matches!(self, Instruction::Measure { .. } | Instruction::Reset { .. })
    }

    fn name(&self) -> String {
        match self {
            Instruction::Unitary { gate, controls, .. } => match controls.len() {
                0 => gate.name().to_string(),
                1 => format!("c{}", gate.name()),
                _ => format!("mc{}", gate.name()),
            },
            Instruction::Measure { .. } => "measure".to_string(),
            Instruction::Reset { .. } => "reset".to_string(),
            Instruction::Barrier => "barrier".to_string(),
        }
    }
}

/// 量子线路
#[derive(Debug, Clone, PartialEq)]
pub struct Circuit {
    name: String,
    num_qubits: usize,
    num_clbits: usize,
    /// 参数名，下标即参数向量中的位置
    parameters: Vec<String>,
    instructions: Vec<Instruction>,
}

impl Circuit {
    pub fn new(num_qubits: usize, num_clbits: usize) -> Self {
        Self::named("circuit", num_qubits, num_clbits)
    }

    pub fn named(name: &str, num_qubits: usize, num_clbits: usize) -> Self {
        Self {
            name: name.to_string(),
            num_qubits,
            num_clbits,
            parameters: Vec::new(),
            instructions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn num_qubits(&self) -> usize {
        self.num_qubits
    }

    pub fn num_clbits(&self) -> usize {
        self.num_clbits
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters.len()
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// 是否只含幺正操作（无测量、无重置）
    pub fn is_unitary(&self) -> bool {
        self.instructions.iter().all(Instruction::is_unitary)
    }

    /// 声明 `prefix[0..n]` 这组新参数
    pub fn add_parameters(&mut self, prefix: &str, n: usize) -> Vec<Param> {
        let start = self.parameters.len();
        self.parameters
            .extend((0..n).map(|i| format!("{}[{}]", prefix, i)));
        (start..start + n).map(Param::symbol).collect()
    }

    fn check_qubit(&self, qubit: usize) -> Result<()> {
        if qubit >= self.num_qubits {
            return Err(QhmmError::QubitOutOfRange { index: qubit, width: self.num_qubits });
        }
        Ok(())
    }

    fn check_clbit(&self, clbit: usize) -> Result<()> {
        if clbit >= self.num_clbits {
            return Err(QhmmError::QubitOutOfRange { index: clbit, width: self.num_clbits });
        }
        Ok(())
    }

    fn check_param(&self, gate: &Gate) -> Result<()> {
        if let Some(Param::Symbol { index, .. }) = gate.param() {
            if index >= self.parameters.len() {
                return Err(QhmmError::UnboundParameter {
                    index,
                    available: self.parameters.len(),
                });
            }
        }
        Ok(())
    }

    /// 添加一个受控单比特门
    pub fn controlled_gate(
        &mut self,
        gate: Gate,
        target: usize,
        controls: &[usize],
        ctrl_state: u64,
    ) -> Result<&mut Self> {
        self.check_qubit(target)?;
        self.check_param(&gate)?;
        if controls.len() >= 64 {
            return Err(QhmmError::invalid("at most 63 control qubits are supported"));
        }
        for (i, &c) in controls.iter().enumerate() {
            self.check_qubit(c)?;
            if c == target || controls[..i].contains(&c) {
                return Err(QhmmError::invalid(format!(
                    "control qubit {} duplicates another operand",
                    c
                )));
            }
        }
        if ctrl_state >> controls.len() != 0 {
            return Err(QhmmError::invalid(format!(
                "ctrl_state {} does not fit {} control qubits",
                ctrl_state,
                controls.len()
            )));
        }
        self.instructions.push(Instruction::Unitary {
            gate,
            target,
            controls: controls.to_vec(),
            ctrl_state,
        });
        Ok(self)
    }

    pub fn gate(&mut self, gate: Gate, target: usize) -> Result<&mut Self> {
        self.controlled_gate(gate, target, &[], 0)
    }

    pub fn h(&mut self, qubit: usize) -> Result<&mut Self> {
        self.gate(Gate::H, qubit)
    }

    pub fn x(&mut self, qubit: usize) -> Result<&mut Self> {
        self.gate(Gate::X, qubit)
    }

    pub fn y(&mut self, qubit: usize) -> Result<&mut Self> {
        self.gate(Gate::Y, qubit)
    }

    pub fn z(&mut self, qubit: usize) -> Result<&mut Self> {
        self.gate(Gate::Z, qubit)
    }

    pub fn rx(&mut self, theta: impl Into<Param>, qubit: usize) -> Result<&mut Self> {
        self.gate(Gate::Rx(theta.into()), qubit)
    }

    pub fn ry(&mut self, theta: impl Into<Param>, qubit: usize) -> Result<&mut Self> {
        self.gate(Gate::Ry(theta.into()), qubit)
    }

    pub fn rz(&mut self, phi: impl Into<Param>, qubit: usize) -> Result<&mut Self> {
        self.gate(Gate::Rz(phi.into()), qubit)
    }

    pub fn p(&mut self, lambda: impl Into<Param>, qubit: usize) -> Result<&mut Self> {
        self.gate(Gate::P(lambda.into()), qubit)
    }

    pub fn cx(&mut self, control: usize, target: usize) -> Result<&mut Self> {
        self.controlled_gate(Gate::X, target, &[control], 1)
    }

    pub fn cp(&mut self, lambda: impl Into<Param>, control: usize, target: usize) -> Result<&mut Self> {
        self.controlled_gate(Gate::P(lambda.into()), target, &[control], 1)
    }

    /// 多控相位门，所有控制位为1时作用
    pub fn mcp(&mut self, lambda: impl Into<Param>, controls: &[usize], target: usize) -> Result<&mut Self> {
        let ctrl_state = if controls.is_empty() { 0 } else { (1u64 << controls.len()) - 1 };
        self.controlled_gate(Gate::P(lambda.into()), target, controls, ctrl_state)
    }

    pub fn measure(&mut self, qubit: usize, clbit: usize) -> Result<&mut Self> {
        self.check_qubit(qubit)?;
        self.check_clbit(clbit)?;
        self.instructions.push(Instruction::Measure { qubit, clbit });
        Ok(self)
    }

    pub fn reset(&mut self, qubit: usize) -> Result<&mut Self> {
        self.check_qubit(qubit)?;
        self.instructions.push(Instruction::Reset { qubit });
        Ok(self)
    }

    pub fn barrier(&mut self) -> &mut Self {
        self.instructions.push(Instruction::Barrier);
        self
    }

    /// 把 `other` 接到本线路之后。
    ///
    /// `other` 的第i个量子比特映射到 `qubits[i]`，第j个经典比特映射到 `clbits[j]`，
    /// 第k个参数映射到 `param_offset + k`。多次使用同一个偏移量即共享参数。
    pub fn compose(
        &mut self,
        other: &Circuit,
        qubits: &[usize],
        clbits: &[usize],
        param_offset: usize,
    ) -> Result<&mut Self> {
        if qubits.len() != other.num_qubits {
            return Err(QhmmError::DimensionMismatch {
                expected: other.num_qubits,
                actual: qubits.len(),
                context: format!("qubit map for composing '{}'", other.name),
            });
        }
        if clbits.len() != other.num_clbits {
            return Err(QhmmError::DimensionMismatch {
                expected: other.num_clbits,
                actual: clbits.len(),
                context: format!("clbit map for composing '{}'", other.name),
            });
        }
        for (i, &q) in qubits.iter().enumerate() {
            self.check_qubit(q)?;
            if qubits[..i].contains(&q) {
                return Err(QhmmError::invalid(format!("qubit {} mapped twice", q)));
            }
        }
        for &c in clbits {
            self.check_clbit(c)?;
        }
        if param_offset > self.parameters.len() {
            return Err(QhmmError::invalid(format!(
                "parameter offset {} leaves a gap after {} parameters",
                param_offset,
                self.parameters.len()
            )));
        }
        for (k, name) in other.parameters.iter().enumerate() {
            if param_offset + k == self.parameters.len() {
                self.parameters.push(name.clone());
            }
        }

        for inst in &other.instructions {
            let mapped = match inst {
                Instruction::Unitary { gate, target, controls, ctrl_state } => Instruction::Unitary {
                    gate: gate.map_param(|p| p.shifted(param_offset)),
                    target: qubits[*target],
                    controls: controls.iter().map(|&c| qubits[c]).collect(),
                    ctrl_state: *ctrl_state,
                },
                Instruction::Measure { qubit, clbit } => Instruction::Measure {
                    qubit: qubits[*qubit],
                    clbit: clbits[*clbit],
                },
                Instruction::Reset { qubit } => Instruction::Reset { qubit: qubits[*qubit] },
                Instruction::Barrier => Instruction::Barrier,
            };
            self.instructions.push(mapped);
        }
        Ok(self)
    }

    /// 在全部量子比特上按顺序拼接（经典比特不映射）
    pub fn append(&mut self, other: &Circuit, qubits: &[usize]) -> Result<&mut Self> {
        let offset = self.parameters.len();
        self.compose(other, qubits, &[], offset)
    }

    /// 受控版本：前 `num_ctrl` 个比特为控制位，控制态为 `ctrl_state` 时作用本线路
    pub fn controlled(&self, num_ctrl: usize, ctrl_state: u64) -> Result<Circuit> {
        if !self.is_unitary() {
            return Err(QhmmError::NonUnitary(format!("cannot control '{}'", self.name)));
        }
        if num_ctrl < 64 && ctrl_state >> num_ctrl != 0 {
            return Err(QhmmError::invalid(format!(
                "ctrl_state {} does not fit {} control qubits",
                ctrl_state, num_ctrl
            )));
        }
        let mut out = Circuit::named(&format!("c_{}", self.name), num_ctrl + self.num_qubits, 0);
        out.parameters = self.parameters.clone();
        for inst in &self.instructions {
            if let Instruction::Unitary { gate, target, controls, ctrl_state: inner } = inst {
                if num_ctrl + controls.len() >= 64 {
                    return Err(QhmmError::invalid("too many control qubits"));
                }
                let mut all_controls: Vec<usize> = (0..num_ctrl).collect();
                all_controls.extend(controls.iter().map(|c| c + num_ctrl));
                out.instructions.push(Instruction::Unitary {
                    gate: *gate,
                    target: target + num_ctrl,
                    controls: all_controls,
                    ctrl_state: ctrl_state | (inner << num_ctrl),
                });
            }
        }
        Ok(out)
    }

    /// 逆线路
    pub fn inverse(&self) -> Result<Circuit> {
        if !self.is_unitary() {
            return Err(QhmmError::NonUnitary(format!("cannot invert '{}'", self.name)));
        }
        let mut out = Circuit::named(&format!("{}_dg", self.name), self.num_qubits, self.num_clbits);
        out.parameters = self.parameters.clone();
        out.instructions = self
            .instructions
            .iter()
            .rev()
            .map(|inst| match inst {
                Instruction::Unitary { gate, target, controls, ctrl_state } => Instruction::Unitary {
                    gate: gate.inverse(),
                    target: *target,
                    controls: controls.clone(),
                    ctrl_state: *ctrl_state,
                },
                other => other.clone(),
            })
            .collect();
        Ok(out)
    }

    /// 代入参数值，得到不含符号参数的线路
    pub fn bind(&self, values: &[f64]) -> Result<Circuit> {
        if values.len() != self.parameters.len() {
            return Err(QhmmError::DimensionMismatch {
                expected: self.parameters.len(),
                actual: values.len(),
                context: format!("parameter values for '{}'", self.name),
            });
        }
        let mut out = Circuit::named(&self.name, self.num_qubits, self.num_clbits);
        for inst in &self.instructions {
            let bound = match inst {
                Instruction::Unitary { gate, target, controls, ctrl_state } => {
                    let gate = match gate.param() {
                        Some(p) => {
                            let v = p.resolve(values)?;
                            gate.map_param(|_| Param::Const(v))
                        }
                        None => *gate,
                    };
                    Instruction::Unitary {
                        gate,
                        target: *target,
                        controls: controls.clone(),
                        ctrl_state: *ctrl_state,
                    }
                }
                other => other.clone(),
            };
            out.instructions.push(bound);
        }
        Ok(out)
    }

    /// 线路深度（忽略 barrier）
    pub fn depth(&self) -> usize {
        let mut qubit_layer = vec![0usize; self.num_qubits];
        let mut clbit_layer = vec![0usize; self.num_clbits];
        let mut depth = 0;
        for inst in &self.instructions {
            let layer = match inst {
                Instruction::Unitary { target, controls, .. } => {
                    let layer = controls
                        .iter()
                        .chain(std::iter::once(target))
                        .map(|&q| qubit_layer[q])
                        .max()
                        .unwrap_or(0)
                        + 1;
                    for &q in controls.iter().chain(std::iter::once(target)) {
                        qubit_layer[q] = layer;
                    }
                    layer
                }
                Instruction::Measure { qubit, clbit } => {
                    let layer = qubit_layer[*qubit].max(clbit_layer[*clbit]) + 1;
                    qubit_layer[*qubit] = layer;
                    clbit_layer[*clbit] = layer;
                    layer
                }
                Instruction::Reset { qubit } => {
                    qubit_layer[*qubit] += 1;
                    qubit_layer[*qubit]
                }
                Instruction::Barrier => continue,
            };
            depth = depth.max(layer);
        }
        depth
    }

    /// 按指令名统计数量
    pub fn count_ops(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for inst in &self.instructions {
            *counts.entry(inst.name()).or_insert(0) += 1;
        }
        counts
    }
}

impl fmt::Display for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} qubits, {} clbits, {} parameters",
            self.name,
            self.num_qubits,
            self.num_clbits,
            self.parameters.len()
        )?;
        for inst in &self.instructions {
            match inst {
                Instruction::Unitary { gate, target, controls, .. } if controls.is_empty() => {
                    writeln!(f, "  {} q{}", gate, target)?
                }
                Instruction::Unitary { gate, target, controls, ctrl_state } => {
                    writeln!(f, "  {} q{} ctrl={:?} state={:b}", gate, target, controls, ctrl_state)?
                }
                Instruction::Measure { qubit, clbit } => writeln!(f, "  measure q{} -> c{}", qubit, clbit)?,
                Instruction::Reset { qubit } => writeln!(f, "  reset q{}", qubit)?,
                Instruction::Barrier => writeln!(f, "  barrier")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_range_checks() {
        let mut circ = Circuit::new(2, 1);
        assert!(circ.h(2).is_err());
        assert!(circ.measure(0, 1).is_err());
        assert!(circ.cx(0, 0).is_err());
        assert!(circ.controlled_gate(Gate::X, 1, &[0], 2).is_err());
        circ.h(0).unwrap().cx(0, 1).unwrap().measure(1, 0).unwrap();
        assert_eq!(circ.instructions().len(), 3);
        assert!(!circ.is_unitary());
    }

    #[test]
    fn test_compose_shares_parameters() {
        let mut block = Circuit::named("block", 1, 0);
        let theta = block.add_parameters("θ", 1);
        block.ry(theta[0], 0).unwrap();

        let mut circ = Circuit::new(2, 0);
        circ.compose(&block, &[0], &[], 0).unwrap();
        circ.compose(&block, &[1], &[], 0).unwrap();
        assert_eq!(circ.num_parameters(), 1);

        circ.append(&block, &[1]).unwrap();
        assert_eq!(circ.num_parameters(), 2);
        assert_eq!(circ.parameters(), &["θ[0]".to_string(), "θ[0]".to_string()]);
    }

    #[test]
    fn test_compose_rejects_bad_maps() {
        let block = Circuit::new(2, 1);
        let mut circ = Circuit::new(3, 1);
        assert!(circ.compose(&block, &[0], &[0], 0).is_err());
        assert!(circ.compose(&block, &[0, 0], &[0], 0).is_err());
        assert!(circ.compose(&block, &[0, 1], &[], 0).is_err());
        assert!(circ.compose(&block, &[0, 1], &[0], 5).is_err());
    }

    #[test]
    fn test_controlled_shifts_and_merges_controls() {
        let mut inner = Circuit::new(2, 0);
        inner.cx(0, 1).unwrap();
        let controlled = inner.controlled(2, 0b10).unwrap();
        assert_eq!(controlled.num_qubits(), 4);
        match &controlled.instructions()[0] {
            Instruction::Unitary { target, controls, ctrl_state, .. } => {
                assert_eq!(*target, 3);
                assert_eq!(controls, &vec![0, 1, 2]);
                assert_eq!(*ctrl_state, 0b110);
            }
            other => panic!("unexpected instruction {:?}", other),
        }
    }

    #[test]
    fn test_non_unitary_rejected() {
        let mut circ = Circuit::new(1, 1);
        circ.measure(0, 0).unwrap();
        assert!(circ.inverse().is_err());
        assert!(circ.controlled(1, 1).is_err());
    }

    #[test]
    fn test_depth_and_counts() {
        let mut circ = Circuit::new(3, 0);
        circ.h(0).unwrap().h(1).unwrap().cx(0, 1).unwrap().barrier().cx(1, 2).unwrap();
        assert_eq!(circ.depth(), 3);
        let counts = circ.count_ops();
        assert_eq!(counts["h"], 2);
        assert_eq!(counts["cx"], 2);
        assert_eq!(counts["barrier"], 1);
    }

    #[test]
    fn test_bind_requires_all_values() {
        let mut circ = Circuit::new(1, 0);
        let params = circ.add_parameters("x", 2);
        circ.rx(params[0], 0).unwrap().rz(params[1], 0).unwrap();
        assert!(circ.bind(&[0.1]).is_err());
        let bound = circ.bind(&[0.1, 0.2]).unwrap();
        assert_eq!(bound.num_parameters(), 0);
        assert_eq!(bound.instructions()[1], Instruction::Unitary {
            gate: Gate::Rz(Param::Const(0.2)),
            target: 0,
            controls: vec![],
            ctrl_state: 0,
        });
    }
}
