//! 可训练量子隐马尔可夫模型
//!
//! 每个时间步作用一次变分线路（各步共享同一组参数），然后测量发射比特并重置。
//! 参数向量的布局为：初态线路的参数在前，变分线路的参数在后。

use std::collections::BTreeMap;
use rand::Rng;
use tracing::debug;

use circuit_sim::{efficient_su2, Circuit, Entanglement, RotationGate, Simulator, TwoLocal};
use common::config::QhmmConfig;
use common::error::{QhmmError, Result};

/// 可作为振幅估计输入的幺正态制备线路
#[derive(Debug, Clone)]
pub struct StatePrep {
    pub circuit: Circuit,
    /// 目标比特在 `circuit` 中的位置
    pub objective: usize,
    /// 第t步第j个发射比特在 `circuit` 中的位置为 `emission_qubits[t*m + j]`
    pub emission_qubits: Vec<usize>,
}

/// 构建参数；至少需要给出比特数或变分线路之一
#[derive(Debug, Clone)]
pub struct QhmmBuilder {
    num_qubits: Option<usize>,
    ansatz: Option<Circuit>,
    initial_state: Option<Circuit>,
    num_time_steps: usize,
    measurement_qubits: Option<Vec<usize>>,
    su2_gates: Vec<RotationGate>,
    entanglement: Entanglement,
    reps: usize,
}

impl Default for QhmmBuilder {
    fn default() -> Self {
        Self {
            num_qubits: None,
            ansatz: None,
            initial_state: None,
            num_time_steps: 1,
            measurement_qubits: None,
            su2_gates: vec![RotationGate::Rz, RotationGate::Rx],
            entanglement: Entanglement::Linear,
            reps: 3,
        }
    }
}

impl QhmmBuilder {
    pub fn num_qubits(mut self, num_qubits: usize) -> Self {
        self.num_qubits = Some(num_qubits);
        self
    }

    pub fn ansatz(mut self, ansatz: Circuit) -> Self {
        self.ansatz = Some(ansatz);
        self
    }

    pub fn initial_state(mut self, initial_state: Circuit) -> Self {
        self.initial_state = Some(initial_state);
        self
    }

    pub fn num_time_steps(mut self, num_time_steps: usize) -> Self {
        self.num_time_steps = num_time_steps;
        self
    }

    pub fn measurement_qubits(mut self, qubits: Vec<usize>) -> Self {
        self.measurement_qubits = Some(qubits);
        self
    }

    /// 默认变分线路的旋转门
    pub fn su2_gates(mut self, gates: Vec<RotationGate>) -> Self {
        self.su2_gates = gates;
        self
    }

    pub fn entanglement(mut self, entanglement: Entanglement) -> Self {
        self.entanglement = entanglement;
        self
    }

    pub fn reps(mut self, reps: usize) -> Self {
        self.reps = reps;
        self
    }

    /// 由配置文件的 `[qhmm]` 段填充
    pub fn from_config(config: &QhmmConfig) -> Result<Self> {
        let su2_gates = config
            .su2_gates
            .iter()
            .map(|g| g.parse::<RotationGate>())
            .collect::<Result<Vec<_>>>()
            .map_err(|e| QhmmError::Config(e.to_string()))?;
        let entanglement = config
            .entanglement
            .parse::<Entanglement>()
            .map_err(|e| QhmmError::Config(e.to_string()))?;
        let mut builder = Self::default()
            .num_qubits(config.num_qubits)
            .su2_gates(su2_gates)
            .entanglement(entanglement)
            .reps(config.reps);
        if !config.measurement_qubits.is_empty() {
            builder = builder.measurement_qubits(config.measurement_qubits.clone());
        }
        Ok(builder)
    }

    pub fn build(self) -> Result<TrainableQhmm> {
        let (num_qubits, initial_state, ansatz) = self.derive_components()?;
        let measurement_qubits = self
            .measurement_qubits
            .unwrap_or_else(|| vec![num_qubits.saturating_sub(1)]);
        TrainableQhmm::from_parts(initial_state, ansatz, self.num_time_steps, measurement_qubits)
    }

    /// 推出比特数、初态与变分线路
    fn derive_components(&self) -> Result<(usize, Circuit, Circuit)> {
        match (self.num_qubits, &self.ansatz) {
            (None, None) => Err(QhmmError::invalid(
                "need at least one of num_qubits or an ansatz",
            )),
            (Some(n), ansatz) => {
                if n == 0 {
                    return Err(QhmmError::invalid("num_qubits must be positive"));
                }
                let ansatz = match ansatz {
                    Some(a) if a.num_qubits() != n => {
                        return Err(QhmmError::DimensionMismatch {
                            expected: n,
                            actual: a.num_qubits(),
                            context: "ansatz width".to_string(),
                        })
                    }
                    Some(a) => a.clone(),
                    None => self.default_ansatz(n)?,
                };
                let initial_state = match &self.initial_state {
                    Some(c) => c.clone(),
                    None => default_initial_state(n)?,
                };
                Ok((n, initial_state, ansatz))
            }
            (None, Some(ansatz)) => {
                let n = ansatz.num_qubits();
                let initial_state = match &self.initial_state {
                    Some(c) if c.num_qubits() > n => {
                        return Err(QhmmError::invalid(format!(
                            "initial state has {} qubits but the ansatz only {}",
                            c.num_qubits(),
                            n
                        )))
                    }
                    Some(c) => c.clone(),
                    None => default_initial_state(n)?,
                };
                Ok((n, initial_state, ansatz.clone()))
            }
        }
    }

    fn default_ansatz(&self, num_qubits: usize) -> Result<Circuit> {
        if self.reps == 3 {
            return efficient_su2(num_qubits, &self.su2_gates, self.entanglement);
        }
        // 非默认层数时直接用 TwoLocal
        let mut ansatz = TwoLocal::new(num_qubits, self.su2_gates.clone(), self.entanglement)
            .reps(self.reps)
            .build()?;
        ansatz.set_name("efficient_su2");
        Ok(ansatz)
    }
}

/// 默认初态：前一半比特与后一半两两纠缠后重置后一半，前一半成为最大混态
pub fn default_initial_state(num_qubits: usize) -> Result<Circuit> {
    if num_qubits % 2 != 0 {
        return Err(QhmmError::invalid(format!(
            "the default initial state needs an even number of qubits, got {}",
            num_qubits
        )));
    }
    let half = num_qubits / 2;
    let mut circ = Circuit::named("initial_state", num_qubits, 0);
    for q in 0..half {
        circ.h(q)?.cx(q, q + half)?.reset(q + half)?;
    }
    Ok(circ)
}

/// 幺正初态：非测量比特上加 H，可用于延迟测量
pub fn hidden_superposition(num_qubits: usize, measurement_qubits: &[usize]) -> Result<Circuit> {
    let mut circ = Circuit::named("hidden_superposition", num_qubits, 0);
    for q in (0..num_qubits).filter(|q| !measurement_qubits.contains(q)) {
        circ.h(q)?;
    }
    Ok(circ)
}

/// 可训练 QHMM
#[derive(Debug, Clone)]
pub struct TrainableQhmm {
    initial_state: Circuit,
    ansatz: Circuit,
    num_time_steps: usize,
    measurement_qubits: Vec<usize>,
    simulator: Simulator,
}

impl TrainableQhmm {
    pub fn builder() -> QhmmBuilder {
        QhmmBuilder::default()
    }

    fn from_parts(
        initial_state: Circuit,
        ansatz: Circuit,
        num_time_steps: usize,
        measurement_qubits: Vec<usize>,
    ) -> Result<Self> {
        let qhmm = Self {
            initial_state,
            ansatz,
            num_time_steps,
            measurement_qubits,
            simulator: Simulator::new(),
        };
        qhmm.validate()?;
        debug!(
            "QHMM: {} qubits, {} steps, measuring {:?}, {} parameters",
            qhmm.num_qubits(),
            qhmm.num_time_steps,
            qhmm.measurement_qubits,
            qhmm.num_parameters()
        );
        Ok(qhmm)
    }

    fn validate(&self) -> Result<()> {
        let n = self.ansatz.num_qubits();
        if n == 0 {
            return Err(QhmmError::invalid("ansatz has no qubits"));
        }
        if self.initial_state.num_qubits() > n {
            return Err(QhmmError::invalid(format!(
                "initial state has {} qubits but the ansatz only {}",
                self.initial_state.num_qubits(),
                n
            )));
        }
        if self.ansatz.num_clbits() != 0 || self.initial_state.num_clbits() != 0 {
            return Err(QhmmError::invalid("ansatz and initial state must not use classical bits"));
        }
        if !self.ansatz.is_unitary() {
            return Err(QhmmError::NonUnitary("the ansatz must be unitary".to_string()));
        }
        if self.num_time_steps == 0 {
            return Err(QhmmError::invalid("num_time_steps must be at least 1"));
        }
        if self.measurement_qubits.is_empty() {
            return Err(QhmmError::invalid("at least one measurement qubit is required"));
        }
        for (i, &q) in self.measurement_qubits.iter().enumerate() {
            if q >= n {
                return Err(QhmmError::QubitOutOfRange { index: q, width: n });
            }
            if self.measurement_qubits[..i].contains(&q) {
                return Err(QhmmError::invalid(format!("measurement qubit {} listed twice", q)));
            }
        }
        Ok(())
    }

    pub fn num_qubits(&self) -> usize {
        self.ansatz.num_qubits()
    }

    pub fn num_time_steps(&self) -> usize {
        self.num_time_steps
    }

    pub fn measurement_qubits(&self) -> &[usize] {
        &self.measurement_qubits
    }

    /// 每个时间步的发射比特数
    pub fn num_emission_bits(&self) -> usize {
        self.measurement_qubits.len()
    }

    pub fn ansatz(&self) -> &Circuit {
        &self.ansatz
    }

    pub fn initial_state(&self) -> &Circuit {
        &self.initial_state
    }

    pub fn num_parameters(&self) -> usize {
        self.initial_state.num_parameters() + self.ansatz.num_parameters()
    }

    pub fn set_num_time_steps(&mut self, num_time_steps: usize) -> Result<()> {
        let previous = std::mem::replace(&mut self.num_time_steps, num_time_steps);
        if let Err(e) = self.validate() {
            self.num_time_steps = previous;
            return Err(e);
        }
        Ok(())
    }

    pub fn set_measurement_qubits(&mut self, qubits: Vec<usize>) -> Result<()> {
        let previous = std::mem::replace(&mut self.measurement_qubits, qubits);
        if let Err(e) = self.validate() {
            self.measurement_qubits = previous;
            return Err(e);
        }
        Ok(())
    }

    /// 带中间测量与重置的完整线路
    pub fn circuit(&self) -> Result<Circuit> {
        let n = self.num_qubits();
        let m = self.measurement_qubits.len();
        let mut circ = Circuit::named("qhmm", n, self.num_time_steps * m);

        let init_qubits: Vec<usize> = (0..self.initial_state.num_qubits()).collect();
        circ.compose(&self.initial_state, &init_qubits, &[], 0)?;

        let all: Vec<usize> = (0..n).collect();
        let ansatz_offset = self.initial_state.num_parameters();
        for t in 0..self.num_time_steps {
            circ.compose(&self.ansatz, &all, &[], ansatz_offset)?;
            for (j, &q) in self.measurement_qubits.iter().enumerate() {
                circ.measure(q, t * m + j)?;
            }
            for &q in &self.measurement_qubits {
                circ.reset(q)?;
            }
        }
        Ok(circ)
    }

    /// 发射比特串的精确分布
    pub fn distribution(&self, params: &[f64]) -> Result<BTreeMap<String, f64>> {
        self.check_params(params)?;
        self.simulator.distribution(&self.circuit()?, params)
    }

    pub fn sample<R: Rng + ?Sized>(&self, params: &[f64], shots: u64, rng: &mut R) -> Result<BTreeMap<String, u64>> {
        self.check_params(params)?;
        self.simulator.sample_counts(&self.circuit()?, params, shots, rng)
    }

    fn check_params(&self, params: &[f64]) -> Result<()> {
        if params.len() != self.num_parameters() {
            return Err(QhmmError::DimensionMismatch {
                expected: self.num_parameters(),
                actual: params.len(),
                context: "QHMM parameters".to_string(),
            });
        }
        Ok(())
    }

    /// 第t步时变分线路各比特在延迟测量线路中的位置
    fn step_layout(&self, t: usize) -> Vec<usize> {
        let n = self.num_qubits();
        let m = self.measurement_qubits.len();
        let mut next_hidden = 0;
        (0..n)
            .map(|q| match self.measurement_qubits.iter().position(|&mq| mq == q) {
                Some(j) => (n - m) + t * m + j,
                None => {
                    next_hidden += 1;
                    next_hidden - 1
                }
            })
            .collect()
    }

    /// 延迟测量：每个时间步的发射比特换成新的比特，得到幺正线路，
    /// 再把 `processing` 接在发射比特上（前 `T*m` 个比特按时间步排列）。
    pub fn to_state_prep(&self, processing: &Circuit, objective: usize) -> Result<StatePrep> {
        if !self.initial_state.is_unitary() {
            return Err(QhmmError::NonUnitary(format!(
                "initial state '{}' has resets or measurements; supply a unitary initial state",
                self.initial_state.name()
            )));
        }
        if !processing.is_unitary() {
            return Err(QhmmError::NonUnitary(format!(
                "processing circuit '{}' must be unitary",
                processing.name()
            )));
        }
        let n = self.num_qubits();
        let m = self.measurement_qubits.len();
        let num_emission_qubits = self.num_time_steps * m;
        if processing.num_qubits() < num_emission_qubits {
            return Err(QhmmError::DimensionMismatch {
                expected: num_emission_qubits,
                actual: processing.num_qubits(),
                context: "processing circuit must cover every emission qubit".to_string(),
            });
        }
        if objective >= processing.num_qubits() {
            return Err(QhmmError::QubitOutOfRange { index: objective, width: processing.num_qubits() });
        }

        let hidden = n - m;
        let mut circ = Circuit::named("qhmm_state_prep", hidden + processing.num_qubits(), 0);

        let first = self.step_layout(0);
        circ.compose(&self.initial_state, &first[..self.initial_state.num_qubits()], &[], 0)?;

        let ansatz_offset = self.initial_state.num_parameters();
        for t in 0..self.num_time_steps {
            circ.compose(&self.ansatz, &self.step_layout(t), &[], ansatz_offset)?;
        }

        let trailing: Vec<usize> = (hidden..hidden + processing.num_qubits()).collect();
        circ.append(processing, &trailing)?;

        Ok(StatePrep {
            circuit: circ,
            objective: hidden + objective,
            emission_qubits: (hidden..hidden + num_emission_qubits).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use circuit_sim::{real_amplitudes, Operator};
    use common::bits::register_to_key;

    /// 两比特变分线路：ry(a) q0, ry(b) q1, cx(0,1), ry(c) q1
    fn small_ansatz() -> Circuit {
        let mut a = Circuit::named("small", 2, 0);
        let p = a.add_parameters("a", 3);
        a.ry(p[0], 0).unwrap().ry(p[1], 1).unwrap().cx(0, 1).unwrap().ry(p[2], 1).unwrap();
        a
    }

    fn small_initial_state() -> Circuit {
        let mut init = Circuit::named("init", 2, 0);
        let p = init.add_parameters("s", 1);
        init.ry(p[0], 0).unwrap().cx(0, 1).unwrap();
        init
    }

    #[test]
    fn test_builder_requires_width_or_ansatz() {
        assert!(TrainableQhmm::builder().build().is_err());
        assert!(TrainableQhmm::builder().num_qubits(3).build().is_err());

        let qhmm = TrainableQhmm::builder().num_qubits(2).num_time_steps(3).build().unwrap();
        assert_eq!(qhmm.num_qubits(), 2);
        assert_eq!(qhmm.measurement_qubits(), &[1]);
        // 默认变分线路 [Rz, Rx] reps=3：4层 * 2门 * 2比特
        assert_eq!(qhmm.num_parameters(), 16);

        let qhmm = TrainableQhmm::builder().ansatz(small_ansatz()).build().unwrap();
        assert_eq!(qhmm.num_qubits(), 2);
        assert_eq!(qhmm.num_time_steps(), 1);
        assert_eq!(qhmm.num_parameters(), 3);

        let wide = Circuit::new(3, 0);
        assert!(TrainableQhmm::builder().ansatz(small_ansatz()).initial_state(wide).build().is_err());
    }

    #[test]
    fn test_builder_validates_measurement_qubits() {
        let build = |qubits: Vec<usize>| {
            TrainableQhmm::builder().ansatz(small_ansatz()).measurement_qubits(qubits).build()
        };
        assert!(build(vec![]).is_err());
        assert!(build(vec![2]).is_err());
        assert!(build(vec![1, 1]).is_err());
        assert!(build(vec![0, 1]).is_ok());

        let mut qhmm = build(vec![1]).unwrap();
        assert!(qhmm.set_num_time_steps(0).is_err());
        assert_eq!(qhmm.num_time_steps(), 1);
        assert!(qhmm.set_measurement_qubits(vec![5]).is_err());
        assert_eq!(qhmm.measurement_qubits(), &[1]);
        qhmm.set_num_time_steps(4).unwrap();
        assert_eq!(qhmm.circuit().unwrap().num_clbits(), 4);
    }

    #[test]
    fn test_from_config() {
        let config = QhmmConfig {
            num_qubits: 2,
            su2_gates: vec!["ry".to_string()],
            entanglement: "circular".to_string(),
            reps: 1,
            measurement_qubits: vec![0],
        };
        let qhmm = QhmmBuilder::from_config(&config).unwrap().build().unwrap();
        assert_eq!(qhmm.num_parameters(), 4);
        assert_eq!(qhmm.measurement_qubits(), &[0]);

        let bad = QhmmConfig { su2_gates: vec!["u3".to_string()], ..config };
        assert!(matches!(QhmmBuilder::from_config(&bad), Err(QhmmError::Config(_))));
    }

    #[test]
    fn test_circuit_matches_manual_construction() {
        let qhmm = TrainableQhmm::builder()
            .ansatz(small_ansatz())
            .num_qubits(2)
            .num_time_steps(2)
            .build()
            .unwrap();
        let values = [0.4, 1.3, -0.7];
        let dist = qhmm.distribution(&values).unwrap();

        let mut expected = Circuit::new(2, 2);
        expected.h(0).unwrap().cx(0, 1).unwrap().reset(1).unwrap();
        for t in 0..2 {
            expected.ry(values[0], 0).unwrap().ry(values[1], 1).unwrap();
            expected.cx(0, 1).unwrap().ry(values[2], 1).unwrap();
            expected.measure(1, t).unwrap().reset(1).unwrap();
        }
        let want = Simulator::new().distribution(&expected, &[]).unwrap();

        assert_eq!(dist.len(), want.len());
        for (key, p) in &want {
            assert!((dist[key] - p).abs() < 1e-12, "{}: {} vs {}", key, dist[key], p);
        }
        let total: f64 = dist.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_default_initial_state_blocks_state_prep() {
        let qhmm = TrainableQhmm::builder().num_qubits(2).build().unwrap();
        let processing = Circuit::new(1, 0);
        assert!(matches!(qhmm.to_state_prep(&processing, 0), Err(QhmmError::NonUnitary(_))));
    }

    #[test]
    fn test_hidden_superposition_allows_state_prep() {
        let init = hidden_superposition(3, &[2]).unwrap();
        assert_eq!(init.count_ops()["h"], 2);
        assert!(init.is_unitary());

        let qhmm = TrainableQhmm::builder()
            .num_qubits(3)
            .initial_state(init)
            .num_time_steps(2)
            .build()
            .unwrap();
        let prep = qhmm.to_state_prep(&Circuit::new(2, 0), 1).unwrap();
        assert_eq!(prep.circuit.num_qubits(), 4);
        assert_eq!(prep.objective, 3);
    }

    #[test]
    fn test_state_prep_rejects_bad_processing() {
        let qhmm = TrainableQhmm::builder()
            .ansatz(small_ansatz())
            .initial_state(small_initial_state())
            .num_time_steps(3)
            .build()
            .unwrap();
        assert!(qhmm.to_state_prep(&Circuit::new(2, 0), 0).is_err());
        assert!(qhmm.to_state_prep(&Circuit::new(3, 0), 3).is_err());
        let mut measured = Circuit::new(3, 1);
        measured.measure(0, 0).unwrap();
        assert!(qhmm.to_state_prep(&measured, 0).is_err());
    }

    #[test]
    fn test_state_prep_matches_manual_construction() {
        let qhmm = TrainableQhmm::builder()
            .ansatz(small_ansatz())
            .initial_state(small_initial_state())
            .num_time_steps(2)
            .build()
            .unwrap();
        let mut processing = Circuit::named("proc", 2, 0);
        processing.cx(0, 1).unwrap();
        let prep = qhmm.to_state_prep(&processing, 1).unwrap();
        assert_eq!(prep.circuit.num_qubits(), 3);
        assert_eq!(prep.objective, 2);
        assert_eq!(prep.emission_qubits, vec![1, 2]);
        assert_eq!(prep.circuit.num_parameters(), 4);

        // 参数布局：初态参数在前
        let values = [0.9, 0.4, 1.3, -0.7];
        let mut expected = Circuit::new(3, 0);
        expected.ry(values[0], 0).unwrap().cx(0, 1).unwrap();
        for emit in [1, 2] {
            expected.ry(values[1], 0).unwrap().ry(values[2], emit).unwrap();
            expected.cx(0, emit).unwrap().ry(values[3], emit).unwrap();
        }
        expected.cx(1, 2).unwrap();

        let got = Operator::from_circuit(&prep.circuit, &values).unwrap();
        let want = Operator::from_circuit(&expected, &[]).unwrap();
        assert!(got.approx_eq(&want, 1e-10));
    }

    #[test]
    fn test_state_prep_marginal_equals_measured_distribution() {
        let qhmm = TrainableQhmm::builder()
            .ansatz(real_amplitudes(2, "phi").unwrap())
            .initial_state(small_initial_state())
            .num_time_steps(2)
            .build()
            .unwrap();
        let values: Vec<f64> = (0..qhmm.num_parameters()).map(|i| 0.3 + 0.37 * i as f64).collect();
        let measured = qhmm.distribution(&values).unwrap();

        let prep = qhmm.to_state_prep(&Circuit::new(2, 0), 0).unwrap();
        let state = Simulator::new().statevector(&prep.circuit, &values).unwrap();
        let mut marginal: BTreeMap<String, f64> = BTreeMap::new();
        for (index, p) in state.probabilities().into_iter().enumerate() {
            let emissions = prep
                .emission_qubits
                .iter()
                .enumerate()
                .fold(0u64, |acc, (bit, &q)| acc | ((((index >> q) & 1) as u64) << bit));
            *marginal.entry(register_to_key(emissions, 2)).or_insert(0.0) += p;
        }

        for (key, p) in &marginal {
            let q = measured.get(key).copied().unwrap_or(0.0);
            assert!((p - q).abs() < 1e-10, "{}: {} vs {}", key, p, q);
        }
    }
}
