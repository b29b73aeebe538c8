//! 常用线路：QFT 和 two-local 变分线路

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use common::error::{QhmmError, Result};
use crate::circuit::Circuit;
use crate::gate::Gate;
use crate::param::Param;

/// 量子傅里叶变换（不含末尾交换，近似度为0）
pub fn qft(num_qubits: usize, inverse: bool) -> Result<Circuit> {
    let mut circ = Circuit::named("qft", num_qubits, 0);
    for j in (0..num_qubits).rev() {
        circ.h(j)?;
        for k in (0..j).rev() {
            let lambda = PI * 2f64.powi(k as i32 - j as i32);
            circ.cp(lambda, j, k)?;
        }
    }
    if inverse {
        let mut inv = circ.inverse()?;
        inv.set_name("iqft");
        return Ok(inv);
    }
    Ok(circ)
}

/// 旋转层可用的门
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationGate {
    Rx,
    Ry,
    Rz,
    P,
}

impl RotationGate {
    fn gate(&self, param: Param) -> Gate {
        match self {
            RotationGate::Rx => Gate::Rx(param),
            RotationGate::Ry => Gate::Ry(param),
            RotationGate::Rz => Gate::Rz(param),
            RotationGate::P => Gate::P(param),
        }
    }
}

impl FromStr for RotationGate {
    type Err = QhmmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rx" => Ok(RotationGate::Rx),
            "ry" => Ok(RotationGate::Ry),
            "rz" => Ok(RotationGate::Rz),
            "p" => Ok(RotationGate::P),
            other => Err(QhmmError::invalid(format!("unsupported rotation gate '{}'", other))),
        }
    }
}

/// 纠缠层的 CX 连接方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entanglement {
    Linear,
    ReverseLinear,
    Circular,
    Full,
}

impl Entanglement {
    /// (控制, 目标) 对
    pub fn pairs(&self, num_qubits: usize) -> Vec<(usize, usize)> {
        if num_qubits < 2 {
            return Vec::new();
        }
        let linear: Vec<(usize, usize)> = (0..num_qubits - 1).map(|i| (i, i + 1)).collect();
        match self {
            Entanglement::Linear => linear,
            Entanglement::ReverseLinear => (0..num_qubits - 1)
                .map(|i| (num_qubits - i - 2, num_qubits - i - 1))
                .collect(),
            Entanglement::Circular => {
                if num_qubits == 2 {
                    return linear;
                }
                let mut pairs = vec![(num_qubits - 1, 0)];
                pairs.extend(linear);
                pairs
            }
            Entanglement::Full => (0..num_qubits)
                .flat_map(|i| (i + 1..num_qubits).map(move |j| (i, j)))
                .collect(),
        }
    }
}

impl FromStr for Entanglement {
    type Err = QhmmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Entanglement::Linear),
            "reverse_linear" => Ok(Entanglement::ReverseLinear),
            "circular" => Ok(Entanglement::Circular),
            "full" => Ok(Entanglement::Full),
            other => Err(QhmmError::invalid(format!("unsupported entanglement '{}'", other))),
        }
    }
}

impl fmt::Display for Entanglement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entanglement::Linear => "linear",
            Entanglement::ReverseLinear => "reverse_linear",
            Entanglement::Circular => "circular",
            Entanglement::Full => "full",
        };
        write!(f, "{}", name)
    }
}

/// 旋转层与 CX 纠缠层交替的变分线路
#[derive(Debug, Clone)]
pub struct TwoLocal {
    pub num_qubits: usize,
    pub rotation_gates: Vec<RotationGate>,
    pub entanglement: Entanglement,
    pub reps: usize,
    pub parameter_prefix: String,
    pub skip_final_rotation_layer: bool,
}

impl TwoLocal {
    pub fn new(num_qubits: usize, rotation_gates: Vec<RotationGate>, entanglement: Entanglement) -> Self {
        Self {
            num_qubits,
            rotation_gates,
            entanglement,
            reps: 3,
            parameter_prefix: "θ".to_string(),
            skip_final_rotation_layer: false,
        }
    }

    pub fn reps(mut self, reps: usize) -> Self {
        self.reps = reps;
        self
    }

    pub fn parameter_prefix(mut self, prefix: &str) -> Self {
        self.parameter_prefix = prefix.to_string();
        self
    }

    pub fn skip_final_rotation_layer(mut self, skip: bool) -> Self {
        self.skip_final_rotation_layer = skip;
        self
    }

    pub fn num_parameters(&self) -> usize {
        let layers = self.reps + usize::from(!self.skip_final_rotation_layer);
        layers * self.rotation_gates.len() * self.num_qubits
    }

    pub fn build(&self) -> Result<Circuit> {
        if self.num_qubits == 0 {
            return Err(QhmmError::invalid("two-local circuit needs at least one qubit"));
        }
        if self.rotation_gates.is_empty() {
            return Err(QhmmError::invalid("two-local circuit needs at least one rotation gate"));
        }
        let mut circ = Circuit::named("two_local", self.num_qubits, 0);
        let params = circ.add_parameters(&self.parameter_prefix, self.num_parameters());
        let mut next = params.into_iter();
        let pairs = self.entanglement.pairs(self.num_qubits);

        for rep in 0..=self.reps {
            if rep == self.reps && self.skip_final_rotation_layer {
                break;
            }
            for rotation in &self.rotation_gates {
                for q in 0..self.num_qubits {
                    let param = next
                        .next()
                        .ok_or_else(|| QhmmError::invalid("ran out of two-local parameters"))?;
                    circ.gate(rotation.gate(param), q)?;
                }
            }
            if rep < self.reps {
                for &(c, t) in &pairs {
                    circ.cx(c, t)?;
                }
            }
        }
        Ok(circ)
    }
}

/// EfficientSU2 风格线路（reps=3）
pub fn efficient_su2(
    num_qubits: usize,
    su2_gates: &[RotationGate],
    entanglement: Entanglement,
) -> Result<Circuit> {
    let mut circ = TwoLocal::new(num_qubits, su2_gates.to_vec(), entanglement).build()?;
    circ.set_name("efficient_su2");
    Ok(circ)
}

/// RealAmplitudes 风格线路：Ry 旋转 + 反向线性纠缠
pub fn real_amplitudes(num_qubits: usize, prefix: &str) -> Result<Circuit> {
    let mut circ = TwoLocal::new(num_qubits, vec![RotationGate::Ry], Entanglement::ReverseLinear)
        .parameter_prefix(prefix)
        .build()?;
    circ.set_name("real_amplitudes");
    Ok(circ)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::Operator;
    use crate::simulator::Simulator;

    #[test]
    fn test_entanglement_pairs() {
        assert_eq!(Entanglement::Linear.pairs(3), vec![(0, 1), (1, 2)]);
        assert_eq!(Entanglement::ReverseLinear.pairs(3), vec![(1, 2), (0, 1)]);
        assert_eq!(Entanglement::Circular.pairs(3), vec![(2, 0), (0, 1), (1, 2)]);
        assert_eq!(Entanglement::Full.pairs(3), vec![(0, 1), (0, 2), (1, 2)]);
        assert!(Entanglement::Linear.pairs(1).is_empty());
        assert_eq!("reverse_linear".parse::<Entanglement>().unwrap(), Entanglement::ReverseLinear);
        assert!("ring".parse::<Entanglement>().is_err());
    }

    #[test]
    fn test_efficient_su2_parameter_count() {
        let circ = efficient_su2(2, &[RotationGate::Ry], Entanglement::Linear).unwrap();
        assert_eq!(circ.num_parameters(), 8);
        assert_eq!(circ.count_ops()["ry"], 8);
        assert_eq!(circ.count_ops()["cx"], 3);

        let circ = efficient_su2(3, &[RotationGate::Rz, RotationGate::Rx], Entanglement::Linear).unwrap();
        assert_eq!(circ.num_parameters(), 24);
    }

    #[test]
    fn test_real_amplitudes_single_qubit() {
        let circ = real_amplitudes(1, "phi").unwrap();
        assert_eq!(circ.num_parameters(), 4);
        assert_eq!(circ.parameters()[0], "phi[0]");
        assert!(!circ.count_ops().contains_key("cx"));
    }

    #[test]
    fn test_two_local_layer_order() {
        // 参数顺序：每层内先按门、再按比特
        let circ = TwoLocal::new(2, vec![RotationGate::Ry, RotationGate::Rz], Entanglement::Linear)
            .reps(1)
            .build()
            .unwrap();
        let mut expected = Circuit::new(2, 0);
        let p = expected.add_parameters("θ", 8);
        expected.ry(p[0], 0).unwrap().ry(p[1], 1).unwrap();
        expected.rz(p[2], 0).unwrap().rz(p[3], 1).unwrap();
        expected.cx(0, 1).unwrap();
        expected.ry(p[4], 0).unwrap().ry(p[5], 1).unwrap();
        expected.rz(p[6], 0).unwrap().rz(p[7], 1).unwrap();
        assert_eq!(circ.instructions(), expected.instructions());
    }

    #[test]
    fn test_qft_maps_basis_to_phase_gradient() {
        // 无交换的 QFT：第j个比特携带相位 2πx/2^(j+1)
        let n = 3;
        let x = 5usize;
        let mut prep = Circuit::new(n, 0);
        for q in 0..n {
            if (x >> q) & 1 == 1 {
                prep.x(q).unwrap();
            }
        }
        prep.compose(&qft(n, false).unwrap(), &[0, 1, 2], &[], 0).unwrap();
        let state = Simulator::new().statevector(&prep, &[]).unwrap();

        let mut expected = Circuit::new(n, 0);
        for q in 0..n {
            expected.h(q).unwrap();
            let phase = 2.0 * PI * x as f64 / 2f64.powi(q as i32 + 1);
            expected.p(phase, q).unwrap();
        }
        let want = Simulator::new().statevector(&expected, &[]).unwrap();
        assert!((state.inner(&want).norm() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_inverse_qft_undoes_qft() {
        let mut circ = qft(4, false).unwrap();
        circ.compose(&qft(4, true).unwrap(), &[0, 1, 2, 3], &[], 0).unwrap();
        let op = Operator::from_circuit(&circ, &[]).unwrap();
        let identity = Operator::from_circuit(&Circuit::new(4, 0), &[]).unwrap();
        assert!(op.approx_eq(&identity, 1e-10));
    }
}
