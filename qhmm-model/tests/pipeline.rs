use circuit_sim::Circuit;
use common::bits::decode_sequence;
use qhmm_model::{
    exact_amplitude, var_circuit, ClassicalHmm, MaximumLikelihoodAe, QhmmTrainer, TrainableQhmm,
    TrainerConfig,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn regime_hmm() -> ClassicalHmm {
    ClassicalHmm::new(
        vec![vec![0.7, 0.3], vec![0.4, 0.6]],
        vec![vec![0.9, 0.1], vec![0.2, 0.8]],
        vec![0.6, 0.4],
    )
    .unwrap()
}

/// 一个隐藏比特加一个发射比特；初态为幺正线路以便延迟测量
fn two_qubit_qhmm(num_time_steps: usize) -> TrainableQhmm {
    let mut init = Circuit::named("init", 2, 0);
    init.h(0).unwrap();
    TrainableQhmm::builder()
        .num_qubits(2)
        .initial_state(init)
        .num_time_steps(num_time_steps)
        .build()
        .unwrap()
}

#[test]
fn test_trained_qhmm_feeds_amplitude_estimation() {
    let hmm = regime_hmm();
    let target = hmm.exact_distribution(2).unwrap();
    let qhmm = two_qubit_qhmm(2);

    let config = TrainerConfig { max_epochs: 30, ..TrainerConfig::default() };
    let report = QhmmTrainer::new(&qhmm, config).fit(&target, None).unwrap();
    assert!(report.loss.is_finite());
    assert!(report.loss <= report.history[0]);
    let params = report.parameters;

    // fp = 3：各总收益都在 1/8 格点上，阈值落在半格点
    let growths = [0.125, -0.25];
    let loss = -0.0625;

    let mut expected = 0.0;
    for (key, p) in qhmm.distribution(&params).unwrap() {
        let total: f64 = decode_sequence(&key, 1).unwrap().iter().map(|&e| growths[e]).sum();
        if total < loss {
            expected += p;
        }
    }

    let var = var_circuit(2, &growths, loss, 4, true).unwrap();
    assert_eq!(var.fractional_precision, 3);
    let prep = qhmm.to_state_prep(&var.circuit, var.objective).unwrap();
    assert_eq!(prep.circuit.num_qubits(), 1 + 2 + 4);

    let amplitude = exact_amplitude(&prep.circuit, prep.objective, &params).unwrap();
    assert!((amplitude - expected).abs() < 1e-9, "{} vs {}", amplitude, expected);

    let bound = prep.circuit.bind(&params).unwrap();
    let mlae = MaximumLikelihoodAe::new(vec![0, 1, 2, 4], 100, 0.95).unwrap();
    let mut rng = StdRng::seed_from_u64(21);
    let estimate = mlae.estimate(&bound, prep.objective, &mut rng).unwrap();
    assert!((estimate.estimation - expected).abs() < 0.05, "{:?} vs {}", estimate, expected);
}

#[test]
fn test_training_moves_towards_hmm_distribution() {
    let hmm = regime_hmm();
    let target = hmm.exact_distribution(1).unwrap();
    let qhmm = two_qubit_qhmm(1);

    let config = TrainerConfig { max_epochs: 80, ..TrainerConfig::default() };
    let report = QhmmTrainer::new(&qhmm, config).fit(&target, None).unwrap();
    let dist = qhmm.distribution(&report.parameters).unwrap();

    // 单步只需匹配 P(o=0) = 0.62
    assert!(report.loss < 1e-2, "loss {}", report.loss);
    assert!((dist["0"] - 0.62).abs() < 0.05, "{:?}", dist);
}
