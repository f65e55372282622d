use approx::assert_relative_eq;
use ndarray::{array, Array2};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};

use baum_welch::embedded::utterance_log_probability;
use baum_welch::forward_backward::log_probability;
use baum_welch::synthetic::sample_utterance;
use baum_welch::{
    train_embedded, train_isolated, Error, GaussianMixture, Hmm, HmmSet, Pattern, PruningConfig,
    TrainingConfig, TrainingSession, TrainingState, TransitionMatrix, Utterance,
};

/// Ten frames in three segments around 0, 5 and 10.
fn segmented_patterns(count: usize, seed: u64) -> Vec<Pattern> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let layouts = [[3, 4, 3], [4, 3, 3], [3, 3, 4], [2, 4, 4], [4, 4, 2]];
    (0..count)
        .map(|n| {
            let mut frames = Array2::zeros((10, 1));
            let mut t = 0;
            for (segment, &len) in layouts[n % layouts.len()].iter().enumerate() {
                for _ in 0..len {
                    frames[[t, 0]] = 5.0 * segment as f64 + noise.sample(&mut rng);
                    t += 1;
                }
            }
            Pattern::new(frames)
        })
        .collect()
}

fn initial_model() -> Hmm {
    Hmm::left_to_right("abc", &[array![1.0], array![4.0], array![8.0]], 0.6).unwrap()
}

#[test]
fn test_isolated_training_converges() {
    let patterns = segmented_patterns(5, 11);
    let session = TrainingSession::new(
        TrainingConfig::default()
            .with_max_iterations(20)
            .with_convergence_threshold(1e-4),
    )
    .unwrap();
    let trained = train_isolated(initial_model(), &patterns, &session).unwrap();

    assert!(trained.report.converged());
    assert_eq!(trained.report.state(), TrainingState::Converged);
    assert!(trained.report.iterations().len() <= 20);
    let a = trained.model.transitions();
    assert_eq!(a.num_states(), 5);
    for i in 0..a.exit() {
        assert_relative_eq!(a.prob().row(i).sum(), 1.0, epsilon = 1e-5);
    }
}

#[test]
fn test_retraining_converged_model_is_stable() {
    let patterns = segmented_patterns(5, 11);
    let session = TrainingSession::new(TrainingConfig::default()).unwrap();
    let first = train_isolated(initial_model(), &patterns, &session).unwrap();
    assert!(first.report.converged());

    let second = train_isolated(first.model.clone(), &patterns, &session).unwrap();
    let change = second.report.iterations()[1].change.unwrap();
    assert!(change.abs() < session.config().convergence_threshold);
}

/// "A" with three emitting states, "B" with two, no tee models.
fn two_model_set() -> HmmSet {
    let mut set = HmmSet::new(2);
    let a = set.add_transition(TransitionMatrix::left_to_right(3, 0.6).unwrap());
    let b = set.add_transition(TransitionMatrix::left_to_right(2, 0.5).unwrap());
    let means = [[0.0, 1.0], [2.0, -1.0], [4.0, 0.0], [6.0, 2.0], [8.0, 0.5]];
    let mixtures: Vec<usize> = means
        .iter()
        .map(|m| {
            set.add_mixture(
                GaussianMixture::single(array![m[0], m[1]], array![1.0, 0.5]).unwrap(),
            )
            .unwrap()
        })
        .collect();
    set.add_model("A", a, mixtures[..3].to_vec()).unwrap();
    set.add_model("B", b, mixtures[3..].to_vec()).unwrap();
    set
}

#[test]
fn test_embedded_matches_unfolded_model() {
    let set = two_model_set();
    let models = set.resolve(&["A", "B"]).unwrap();
    let flat = set.concatenate(&models).unwrap();
    assert_eq!(flat.num_states(), 7);

    let mut rng = ChaCha20Rng::seed_from_u64(3);
    let noise = Normal::new(0.0, 1.5).unwrap();
    let mut frames = Array2::zeros((20, 2));
    for t in 0..20 {
        frames[[t, 0]] = 0.4 * t as f64 + noise.sample(&mut rng);
        frames[[t, 1]] = noise.sample(&mut rng);
    }
    let pattern = Pattern::new(frames);
    let expected = log_probability(&flat, &pattern).unwrap();
    let utterance = Utterance::new("ab", pattern, models);

    for pruning in [PruningConfig::disabled(), PruningConfig::default()] {
        let session =
            TrainingSession::new(TrainingConfig::default().with_pruning(pruning)).unwrap();
        let got = utterance_log_probability(&set, &utterance, &session)
            .unwrap()
            .unwrap();
        assert_relative_eq!(got, expected, epsilon = 1e-6, max_relative = 1e-9);
    }
}

/// Three models over scalar data; "sp" is a tee model.
fn generator(offset: f64) -> HmmSet {
    let mut set = HmmSet::new(1);
    let lr3 = set.add_transition(TransitionMatrix::left_to_right(3, 0.6).unwrap());
    let lr2 = set.add_transition(TransitionMatrix::left_to_right(2, 0.5).unwrap());
    let tee = set.add_transition(
        TransitionMatrix::new(array![
            [0.0, 0.6, 0.4],
            [0.0, 0.5, 0.5],
            [0.0, 0.0, 0.0]
        ])
        .unwrap(),
    );
    let mut mixture = |mean: f64| {
        set.add_mixture(GaussianMixture::single(array![mean + offset], array![1.0]).unwrap())
            .unwrap()
    };
    let a = vec![mixture(0.0), mixture(4.0), mixture(8.0)];
    let b = vec![mixture(12.0), mixture(16.0)];
    let sp = vec![mixture(-4.0)];
    set.add_model("a", lr3, a).unwrap();
    set.add_model("b", lr2, b).unwrap();
    set.add_model("sp", tee, sp).unwrap();
    set
}

fn sampled_corpus(set: &HmmSet) -> Vec<Utterance> {
    let transcriptions: [&[&str]; 6] = [
        &["a", "sp", "b"],
        &["b", "a"],
        &["a", "b", "sp"],
        &["sp", "a", "b"],
        &["b", "sp", "a"],
        &["a", "b"],
    ];
    let mut rng = ChaCha20Rng::seed_from_u64(42);
    (0..12)
        .map(|n| {
            let labels = transcriptions[n % transcriptions.len()];
            sample_utterance(set, format!("utt{}", n), labels, 80, &mut rng).unwrap()
        })
        .collect()
}

#[test]
fn test_embedded_training_on_sampled_data() {
    let truth = generator(0.0);
    let utterances = sampled_corpus(&truth);
    let session = TrainingSession::new(TrainingConfig::default()).unwrap();
    let (trained, occupancy) = train_embedded(generator(0.7), &utterances, &session).unwrap();

    let passes = trained.report.iterations();
    assert_eq!(passes[0].pass.accumulated, utterances.len());
    assert!(passes.last().unwrap().pass.log_prob > passes[0].pass.log_prob);
    assert_eq!(trained.report.total_skipped(), 0);

    for matrix in trained.model.transitions() {
        for i in 0..matrix.exit() {
            assert_relative_eq!(matrix.prob().row(i).sum(), 1.0, epsilon = 1e-5);
        }
    }
    // the first state of "a" moves back towards the generator
    let a0 = trained.model.mixtures()[0].components()[0].mean()[0];
    assert!(a0.abs() < 0.7);

    assert_eq!(occupancy.get("a").unwrap().occurrences, 12);
    assert_eq!(occupancy.get("b").unwrap().occurrences, 12);
    assert_eq!(occupancy.get("sp").unwrap().occurrences, 8);
    assert!(occupancy.to_string().contains("\"sp\""));
}

#[test]
fn test_consecutive_tee_models_rejected() {
    let mut set = generator(0.0);
    let tee = set.model(2).transition();
    let sp_mixture = set.model(2).mixtures().to_vec();
    set.add_model("sp2", tee, sp_mixture).unwrap();
    let models = set.resolve(&["a", "sp", "sp2", "b"]).unwrap();
    let pattern = Pattern::from_rows(&vec![vec![0.0]; 12]).unwrap();
    let utterances = vec![Utterance::new("bad", pattern, models)];
    let session = TrainingSession::new(TrainingConfig::default()).unwrap();
    assert!(matches!(
        train_embedded(set, &utterances, &session),
        Err(Error::ConsecutiveTeeModels { .. })
    ));
}
