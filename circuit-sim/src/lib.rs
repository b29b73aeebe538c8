//! 量子线路中间表示与精确态矢量模拟器
//!
//! 所有幺正指令都统一为“带任意控制位的单比特门”，
//! 因此受控化、求逆和拼接都只需逐条改写指令。
//! 比特顺序为小端：第0个量子比特是基矢下标的最低位。

pub mod circuit;
pub mod gate;
pub mod library;
pub mod operator;
pub mod param;
pub mod simulator;
pub mod statevector;

pub use circuit::{Circuit, Instruction};
pub use gate::Gate;
pub use library::{efficient_su2, qft, real_amplitudes, Entanglement, RotationGate, TwoLocal};
pub use operator::Operator;
pub use param::Param;
pub use simulator::Simulator;
pub use statevector::Statevector;
