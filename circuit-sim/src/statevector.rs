use num_complex::Complex64;

use crate::gate::Matrix2;

/// 小端态矢量：第q个量子比特对应基矢下标的第q位
#[derive(Debug, Clone, PartialEq)]
pub struct Statevector {
    num_qubits: usize,
    amplitudes: Vec<Complex64>,
}

impl Statevector {
    /// |0...0>
    pub fn zero(num_qubits: usize) -> Self {
        Self::basis(num_qubits, 0)
    }

    pub fn basis(num_qubits: usize, index: usize) -> Self {
        let mut amplitudes = vec![Complex64::new(0.0, 0.0); 1 << num_qubits];
        amplitudes[index] = Complex64::new(1.0, 0.0);
        Self { num_qubits, amplitudes }
    }

    pub fn num_qubits(&self) -> usize {
        self.num_qubits
    }

    pub fn amplitudes(&self) -> &[Complex64] {
        &self.amplitudes
    }

    /// 作用单比特矩阵，仅当控制位满足 `ctrl_value`（按掩码 `ctrl_mask`）时生效
    pub fn apply(&mut self, matrix: &Matrix2, target: usize, ctrl_mask: usize, ctrl_value: usize) {
        let tbit = 1usize << target;
        for i in 0..self.amplitudes.len() {
            if i & tbit != 0 || i & ctrl_mask != ctrl_value {
                continue;
            }
            let j = i | tbit;
            let a0 = self.amplitudes[i];
            let a1 = self.amplitudes[j];
            self.amplitudes[i] = matrix[0][0] * a0 + matrix[0][1] * a1;
            self.amplitudes[j] = matrix[1][0] * a0 + matrix[1][1] * a1;
        }
    }

    /// 测得第 `qubit` 位为1的概率
    pub fn probability_of_one(&self, qubit: usize) -> f64 {
        let bit = 1usize << qubit;
        self.amplitudes
            .iter()
            .enumerate()
            .filter(|(i, _)| i & bit != 0)
            .map(|(_, a)| a.norm_sqr())
            .sum()
    }

    pub fn probabilities(&self) -> Vec<f64> {
        self.amplitudes.iter().map(|a| a.norm_sqr()).collect()
    }

    pub fn norm_sqr(&self) -> f64 {
        self.amplitudes.iter().map(|a| a.norm_sqr()).sum()
    }

    /// 投影到 `qubit == outcome` 并归一化，返回该结果的概率
    pub fn collapse(&mut self, qubit: usize, outcome: bool) -> f64 {
        let bit = 1usize << qubit;
        let mut prob = 0.0;
        for (i, a) in self.amplitudes.iter_mut().enumerate() {
            if (i & bit != 0) != outcome {
                *a = Complex64::new(0.0, 0.0);
            } else {
                prob += a.norm_sqr();
            }
        }
        if prob > 0.0 {
            let scale = 1.0 / prob.sqrt();
            for a in self.amplitudes.iter_mut() {
                *a *= scale;
            }
        }
        prob
    }

    /// 交换 |..0..> 与 |..1..>（等价于 X 门）
    pub fn flip(&mut self, qubit: usize) {
        let bit = 1usize << qubit;
        for i in 0..self.amplitudes.len() {
            if i & bit == 0 {
                self.amplitudes.swap(i, i | bit);
            }
        }
    }

    /// 内积 <self|other>
    pub fn inner(&self, other: &Statevector) -> Complex64 {
        self.amplitudes
            .iter()
            .zip(other.amplitudes.iter())
            .map(|(a, b)| a.conj() * b)
            .sum()
    }
}
