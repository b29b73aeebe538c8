use std::f64::consts::FRAC_1_SQRT_2;
use std::fmt;
use num_complex::Complex64;

use common::error::Result;
use crate::param::Param;

/// 2x2 复矩阵，按行存储
pub type Matrix2 = [[Complex64; 2]; 2];

/// 单比特门
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gate {
    H,
    X,
    Y,
    Z,
    Rx(Param),
    Ry(Param),
    Rz(Param),
    /// 相位门 diag(1, e^{iλ})
    P(Param),
}

impl Gate {
    pub fn name(&self) -> &'static str {
        match self {
            Gate::H => "h",
            Gate::X => "x",
            Gate::Y => "y",
            Gate::Z => "z",
            Gate::Rx(_) => "rx",
            Gate::Ry(_) => "ry",
            Gate::Rz(_) => "rz",
            Gate::P(_) => "p",
        }
    }

    pub fn param(&self) -> Option<Param> {
        match *self {
            Gate::Rx(p) | Gate::Ry(p) | Gate::Rz(p) | Gate::P(p) => Some(p),
            _ => None,
        }
    }

    pub fn map_param(&self, f: impl Fn(Param) -> Param) -> Gate {
        match *self {
            Gate::Rx(p) => Gate::Rx(f(p)),
            Gate::Ry(p) => Gate::Ry(f(p)),
            Gate::Rz(p) => Gate::Rz(f(p)),
            Gate::P(p) => Gate::P(f(p)),
            other => other,
        }
    }

    /// 逆门；H/X/Y/Z 自逆，旋转门取负角
    pub fn inverse(&self) -> Gate {
        self.map_param(|p| p.negated())
    }

    pub fn matrix(&self, values: &[f64]) -> Result<Matrix2> {
        let zero = Complex64::new(0.0, 0.0);
        let one = Complex64::new(1.0, 0.0);
        let i = Complex64::new(0.0, 1.0);
        let m = match self {
            Gate::H => {
                let h = Complex64::new(FRAC_1_SQRT_2, 0.0);
                [[h, h], [h, -h]]
            }
            Gate::X => [[zero, one], [one, zero]],
            Gate::Y => [[zero, -i], [i, zero]],
            Gate::Z => [[one, zero], [zero, -one]],
            Gate::Rx(p) => {
                let half = p.resolve(values)? / 2.0;
                let c = Complex64::new(half.cos(), 0.0);
                let s = Complex64::new(0.0, -half.sin());
                [[c, s], [s, c]]
            }
            Gate::Ry(p) => {
                let half = p.resolve(values)? / 2.0;
                let c = Complex64::new(half.cos(), 0.0);
                let s = Complex64::new(half.sin(), 0.0);
                [[c, -s], [s, c]]
            }
            Gate::Rz(p) => {
                let half = p.resolve(values)? / 2.0;
                [
                    [Complex64::from_polar(1.0, -half), zero],
                    [zero, Complex64::from_polar(1.0, half)],
                ]
            }
            Gate::P(p) => {
                let lambda = p.resolve(values)?;
                [[one, zero], [zero, Complex64::from_polar(1.0, lambda)]]
            }
        };
        Ok(m)
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.param() {
            Some(Param::Const(v)) => write!(f, "{}({:.4})", self.name(), v),
            Some(Param::Symbol { index, scale }) if scale == 1.0 => {
                write!(f, "{}(x[{}])", self.name(), index)
            }
            Some(Param::Symbol { index, scale }) => {
                write!(f, "{}({}*x[{}])", self.name(), scale, index)
            }
            None => write!(f, "{}", self.name()),
        }
    }
}
