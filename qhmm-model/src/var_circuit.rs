//! VaR 处理线路
//!
//! 价值寄存器在傅里叶基下做定点加法：每个时间步按发射比特受控地加上
//! 对应的对数收益，再减去亏损阈值，最后逆 QFT 回到计算基。
//! 寄存器最高位（补码符号位）为1的概率即总收益低于阈值的概率。

use std::f64::consts::PI;

use circuit_sim::{qft, Circuit};
use common::bits::num_bits_for;
use common::error::{QhmmError, Result};

/// 由收益范围推出价值寄存器的小数位数
pub fn precision_from_growths(growths: &[f64], num_val_qubits: usize, num_time_steps: usize) -> Result<i32> {
    if growths.is_empty() {
        return Err(QhmmError::invalid("growths must not be empty"));
    }
    let max = growths.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min = growths.iter().cloned().fold(f64::INFINITY, f64::min);
    let max_growth = num_time_steps as f64 * (max - min);
    if !(max_growth > 0.0) || !max_growth.is_finite() {
        return Err(QhmmError::invalid(format!(
            "growth spread over {} steps must be positive and finite, got {}",
            num_time_steps, max_growth
        )));
    }

    let mut integer_precision = num_val_qubits as i32;
    while max_growth < 2f64.powi(integer_precision - 2) {
        integer_precision -= 1;
    }
    while max_growth >= 2f64.powi(integer_precision) {
        integer_precision += 1;
    }
    Ok(num_val_qubits as i32 - integer_precision)
}

/// 傅里叶基下加常数：第i个价值比特加相位 value·π·2^(fp-i)
pub fn adder_base_qft(value: f64, num_val_qubits: usize, fractional_precision: i32) -> Result<Circuit> {
    let mut circ = Circuit::named("add_value", num_val_qubits, 0);
    for i in 0..num_val_qubits {
        let lambda = value * PI * 2f64.powi(fractional_precision - i as i32);
        circ.p(lambda, i)?;
    }
    Ok(circ)
}

/// 单步收益加法：状态比特在前，价值比特在后
pub fn one_step_growths(growths: &[f64], num_val_qubits: usize, fractional_precision: i32) -> Result<Circuit> {
    let num_state_qubits = num_bits_for(growths.len());
    let mut circ = Circuit::named("add_growth", num_state_qubits + num_val_qubits, 0);
    let all: Vec<usize> = (0..circ.num_qubits()).collect();
    for (ctrl, &growth) in growths.iter().enumerate() {
        if growth == 0.0 {
            continue;
        }
        let add = adder_base_qft(growth, num_val_qubits, fractional_precision)?
            .controlled(num_state_qubits, ctrl as u64)?;
        circ.append(&add, &all)?;
    }
    Ok(circ)
}

/// 构建好的 VaR 线路及其布局信息
#[derive(Debug, Clone)]
pub struct VarCircuit {
    pub circuit: Circuit,
    pub num_time_steps: usize,
    pub num_state_qubits: usize,
    pub num_val_qubits: usize,
    pub fractional_precision: i32,
    /// 目标比特（价值寄存器符号位）
    pub objective: usize,
}

impl VarCircuit {
    pub fn value_qubits(&self) -> Vec<usize> {
        let start = self.num_state_qubits * self.num_time_steps;
        (start..start + self.num_val_qubits).collect()
    }
}

/// 构建 VaR 处理线路
pub fn var_circuit(
    num_time_steps: usize,
    growths: &[f64],
    loss: f64,
    num_val_qubits: usize,
    insert_barriers: bool,
) -> Result<VarCircuit> {
    if num_val_qubits < 2 {
        return Err(QhmmError::invalid("the value register needs at least two qubits"));
    }
    let num_state_qubits = num_bits_for(growths.len());
    let fractional_precision = precision_from_growths(growths, num_val_qubits, num_time_steps)?;

    let num_qubits = num_val_qubits + num_state_qubits * num_time_steps;
    let mut circ = Circuit::named("var", num_qubits, 0);
    let val_qubits: Vec<usize> = (num_state_qubits * num_time_steps..num_qubits).collect();

    // 价值寄存器置于傅里叶基
    for &q in &val_qubits {
        circ.h(q)?;
    }

    let osg = one_step_growths(growths, num_val_qubits, fractional_precision)?;
    for ts in 0..num_time_steps {
        if insert_barriers {
            circ.barrier();
        }
        let mut qubits: Vec<usize> = (ts * num_state_qubits..(ts + 1) * num_state_qubits).collect();
        qubits.extend(&val_qubits);
        circ.append(&osg, &qubits)?;
    }

    if insert_barriers {
        circ.barrier();
    }

    // 与亏损阈值比较：额外减半个最低位，避免相等时落在边界上
    if loss != 0.0 {
        let loss_adjustment = -2f64.powi(-1 - fractional_precision);
        let comparator = adder_base_qft(loss_adjustment - loss, num_val_qubits, fractional_precision)?;
        circ.append(&comparator, &val_qubits)?;
        if insert_barriers {
            circ.barrier();
        }
    }

    circ.append(&qft(num_val_qubits, true)?, &val_qubits)?;

    Ok(VarCircuit {
        objective: num_qubits - 1,
        circuit: circ,
        num_time_steps,
        num_state_qubits,
        num_val_qubits,
        fractional_precision,
    })
}
