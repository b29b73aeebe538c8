use num_complex::Complex64;

use common::error::{QhmmError, Result};
use crate::circuit::Circuit;
use crate::simulator::{compile, run_unitary_steps};
use crate::statevector::Statevector;

/// 线路对应的完整幺正矩阵（按行存储）
#[derive(Debug, Clone)]
pub struct Operator {
    dim: usize,
    data: Vec<Complex64>,
}

impl Operator {
    pub fn from_circuit(circuit: &Circuit, params: &[f64]) -> Result<Self> {
        if !circuit.is_unitary() {
            return Err(QhmmError::NonUnitary(format!("'{}' has no operator", circuit.name())));
        }
        if circuit.num_qubits() > 12 {
            return Err(QhmmError::invalid("operator extraction is limited to 12 qubits"));
        }
        let steps = compile(circuit, params)?;
        let dim = 1usize << circuit.num_qubits();
        let mut data = vec![Complex64::new(0.0, 0.0); dim * dim];
        for col in 0..dim {
            let mut state = Statevector::basis(circuit.num_qubits(), col);
            run_unitary_steps(&steps, &mut state);
            for (row, amp) in state.amplitudes().iter().enumerate() {
                data[row * dim + col] = *amp;
            }
        }
        Ok(Self { dim, data })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn get(&self, row: usize, col: usize) -> Complex64 {
        self.data[row * self.dim + col]
    }

    /// 逐元素比较
    pub fn approx_eq(&self, other: &Operator, tol: f64) -> bool {
        self.dim == other.dim
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| (a - b).norm() <= tol)
    }

    /// 允许相差一个全局相位
    pub fn equiv_up_to_global_phase(&self, other: &Operator, tol: f64) -> bool {
        if self.dim != other.dim {
            return false;
        }
        let pivot = self
            .data
            .iter()
            .zip(other.data.iter())
            .find(|(a, _)| a.norm() > tol);
        let phase = match pivot {
            Some((a, b)) => {
                let ratio = b / a;
                if (ratio.norm() - 1.0).abs() > tol {
                    return false;
                }
                ratio
            }
            None => return other.data.iter().all(|b| b.norm() <= tol),
        };
        self.data
            .iter()
            .zip(other.data.iter())
            .all(|(a, b)| (a * phase - b).norm() <= tol)
    }

    /// 检查 U†U = I
    pub fn is_unitary(&self, tol: f64) -> bool {
        let n = self.dim;
        for i in 0..n {
            for j in 0..n {
                let mut acc = Complex64::new(0.0, 0.0);
                for k in 0..n {
                    acc += self.get(k, i).conj() * self.get(k, j);
                }
                let expected = if i == j { 1.0 } else { 0.0 };
                if (acc - expected).norm() > tol {
                    return false;
                }
            }
        }
        true
    }
}
