use common::error::{QhmmError, Result};

/// 门参数：常量角度，或参数向量中某一项的倍数
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Param {
    Const(f64),
    Symbol { index: usize, scale: f64 },
}

impl Param {
    pub fn symbol(index: usize) -> Self {
        Param::Symbol { index, scale: 1.0 }
    }

    /// 用参数值求出角度
    pub fn resolve(&self, values: &[f64]) -> Result<f64> {
        match *self {
            Param::Const(v) => Ok(v),
            Param::Symbol { index, scale } => values
                .get(index)
                .map(|v| v * scale)
                .ok_or(QhmmError::UnboundParameter { index, available: values.len() }),
        }
    }

    pub fn negated(&self) -> Self {
        match *self {
            Param::Const(v) => Param::Const(-v),
            Param::Symbol { index, scale } => Param::Symbol { index, scale: -scale },
        }
    }

    /// 参数下标整体平移（拼接线路时使用）
    pub fn shifted(&self, offset: usize) -> Self {
        match *self {
            Param::Const(v) => Param::Const(v),
            Param::Symbol { index, scale } => Param::Symbol { index: index + offset, scale },
        }
    }
}

impl From<f64> for Param {
    fn from(value: f64) -> Self {
        Param::Const(value)
    }
}
