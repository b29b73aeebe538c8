//! 发射序列与经典寄存器的比特串编码
//!
//! 约定与经典比特寄存器一致：第0个比特在最右边。
//! 第t个时间步的发射占用 `[t*b, (t+1)*b)` 这些比特。

use crate::error::{QhmmError, Result};

/// 表示 `count` 个不同取值所需的比特数
pub fn num_bits_for(count: usize) -> usize {
    if count <= 1 {
        return 0;
    }
    (usize::BITS - (count - 1).leading_zeros()) as usize
}

/// 把整数寄存器值渲染成比特串（第0位在最右），超过64位的高位补0
pub fn register_to_key(value: u64, width: usize) -> String {
    (0..width)
        .rev()
        .map(|bit| if bit < 64 && (value >> bit) & 1 == 1 { '1' } else { '0' })
        .collect()
}

/// 比特串解析回整数寄存器值
pub fn key_to_register(key: &str) -> Result<u64> {
    if key.len() > 64 {
        return Err(QhmmError::invalid(format!("bitstring too long: {} bits", key.len())));
    }
    let mut value = 0u64;
    for c in key.chars() {
        value <<= 1;
        match c {
            '0' => {}
            '1' => value |= 1,
            other => {
                return Err(QhmmError::invalid(format!("invalid character {:?} in bitstring", other)))
            }
        }
    }
    Ok(value)
}

fn check_width(bits_per_emission: usize) -> Result<()> {
    if bits_per_emission > usize::BITS as usize {
        return Err(QhmmError::invalid(format!(
            "{} bits per emission does not fit a usize",
            bits_per_emission
        )));
    }
    Ok(())
}

/// 编码发射序列，每个发射占 `bits_per_emission` 位
///
/// 按组拼接，序列长度不受寄存器宽度限制。
pub fn encode_sequence(sequence: &[usize], bits_per_emission: usize) -> Result<String> {
    check_width(bits_per_emission)?;
    let mut key = String::with_capacity(sequence.len() * bits_per_emission);
    for (t, &emission) in sequence.iter().enumerate().rev() {
        if bits_per_emission < usize::BITS as usize && emission >> bits_per_emission != 0 {
            return Err(QhmmError::invalid(format!(
                "emission {} at step {} does not fit in {} bits",
                emission, t, bits_per_emission
            )));
        }
        for bit in (0..bits_per_emission).rev() {
            key.push(if (emission >> bit) & 1 == 1 { '1' } else { '0' });
        }
    }
    Ok(key)
}

/// 解码发射序列
pub fn decode_sequence(key: &str, bits_per_emission: usize) -> Result<Vec<usize>> {
    if bits_per_emission == 0 {
        return Err(QhmmError::invalid("bits_per_emission must be positive"));
    }
    check_width(bits_per_emission)?;
    if key.len() % bits_per_emission != 0 {
        return Err(QhmmError::DimensionMismatch {
            expected: bits_per_emission,
            actual: key.len(),
            context: "key length must be a multiple of the emission width".to_string(),
        });
    }
    let bytes = key.as_bytes();
    let mut sequence = Vec::with_capacity(bytes.len() / bits_per_emission);
    // 最右边的一组是第0步
    for group in bytes.rchunks(bits_per_emission) {
        let mut emission = 0usize;
        for &c in group {
            emission = match c {
                b'0' => emission << 1,
                b'1' => (emission << 1) | 1,
                other => {
                    return Err(QhmmError::invalid(format!(
                        "invalid character {:?} in bitstring",
                        other as char
                    )))
                }
            };
        }
        sequence.push(emission);
    }
    Ok(sequence)
}
