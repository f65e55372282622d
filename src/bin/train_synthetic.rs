use ndarray::array;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use baum_welch::synthetic::{sample_pattern, sample_utterance};
use baum_welch::{
    train_embedded, train_isolated, GaussianMixture, Hmm, HmmSet, Result, TrainingConfig,
    TrainingSession, TransitionMatrix,
};

fn isolated(rng: &mut ChaCha20Rng) -> Result<()> {
    let truth = Hmm::left_to_right("word", &[array![0.0], array![5.0], array![10.0]], 0.6)?;
    let patterns = (0..20)
        .map(|_| sample_pattern(&truth, 40, rng))
        .collect::<Result<Vec<_>>>()?;

    let initial = Hmm::left_to_right("word", &[array![1.0], array![4.0], array![8.0]], 0.5)?;
    let session = TrainingSession::new(TrainingConfig::default())?;
    let trained = train_isolated(initial, &patterns, &session)?;

    println!("{}", trained.report);
    for (j, mixture) in trained.model.mixtures().iter().enumerate() {
        let g = &mixture.components()[0];
        println!(
            "state {}: mean {:.3} variance {:.3}",
            j + 1,
            g.mean()[0],
            g.variance()[0]
        );
    }
    println!("transitions:\n{:.3}\n", trained.model.transitions().prob());
    Ok(())
}

fn model_set(offset: f64) -> Result<HmmSet> {
    let mut set = HmmSet::new(1);
    let lr3 = set.add_transition(TransitionMatrix::left_to_right(3, 0.6)?);
    let tee = set.add_transition(TransitionMatrix::new(array![
        [0.0, 0.5, 0.5],
        [0.0, 0.5, 0.5],
        [0.0, 0.0, 0.0]
    ])?);
    for (label, means) in [("one", [0.0, 3.0, 6.0]), ("two", [10.0, 13.0, 16.0])] {
        let mixtures = means
            .iter()
            .map(|&m| set.add_mixture(GaussianMixture::single(array![m + offset], array![1.0])?))
            .collect::<Result<Vec<_>>>()?;
        set.add_model(label, lr3, mixtures)?;
    }
    let pause = set.add_mixture(GaussianMixture::single(array![-5.0 + offset], array![1.0])?)?;
    set.add_model("sp", tee, vec![pause])?;
    Ok(set)
}

fn embedded(rng: &mut ChaCha20Rng) -> Result<()> {
    let truth = model_set(0.0)?;
    let transcriptions: [&[&str]; 4] = [
        &["one", "sp", "two"],
        &["two", "one"],
        &["one", "two", "sp", "one"],
        &["two", "sp", "two"],
    ];
    let utterances = (0..24)
        .map(|n| {
            let labels = transcriptions[n % transcriptions.len()];
            sample_utterance(&truth, format!("utt{:02}", n), labels, 120, rng)
        })
        .collect::<Result<Vec<_>>>()?;

    let session = TrainingSession::new(TrainingConfig::default().with_parallel(true))?;
    let (trained, occupancy) = train_embedded(model_set(1.0)?, &utterances, &session)?;
    println!("{}", trained.report);
    println!("occupancy:\n{}", occupancy);
    Ok(())
}

fn main() {
    let mut rng = ChaCha20Rng::seed_from_u64(2024);
    if let Err(e) = isolated(&mut rng).and_then(|_| embedded(&mut rng)) {
        eprintln!("training failed: {}", e);
        std::process::exit(1);
    }
}
