//! Embedded training: a set of shared models over transcribed utterances.

use log::{debug, warn};

use super::{iterate, EmTrainer, PassSummary, PatternOutcome, SkipReason, Trained};
use crate::accumulator::{OccupancyTally, Statistics};
use crate::embedded::{process_utterance, validate_utterance, EmbeddedScratch};
use crate::error::{Error, Result};
use crate::model::HmmSet;
use crate::pattern::Utterance;
use crate::reestimate::{reestimate_mixture, reestimate_transitions, UpdateSummary};
use crate::report::OccupancyReport;
use crate::session::TrainingSession;

/// Statistics of one embedded pass.
#[derive(Debug, Clone)]
pub struct EmbeddedStats {
    pub stats: Statistics,
    pub tally: OccupancyTally,
}

impl EmbeddedStats {
    fn zeroed(set: &HmmSet) -> Self {
        Self {
            stats: Statistics::zeroed(set.transitions(), set.mixtures()),
            tally: OccupancyTally::new(set.models().len()),
        }
    }

    fn merge(&mut self, other: &Self) {
        self.stats.merge(&other.stats);
        self.tally.merge(&other.tally);
    }
}

/// Per-worker buffers: scratch arena and utterance-local statistics.
///
/// `local` is shaped on the model of the current pass: component
/// statistics are kept relative to the prior means, so it is rebuilt
/// whenever the model changes.
struct Worker {
    scratch: EmbeddedScratch,
    local: Statistics,
}

impl Worker {
    fn new(set: &HmmSet, utterances: &[Utterance]) -> Self {
        Self {
            scratch: EmbeddedScratch::for_utterances(set, utterances),
            local: Statistics::zeroed(set.transitions(), set.mixtures()),
        }
    }
}

/// Baum-Welch for an [`HmmSet`] over utterances with model sequences.
pub struct EmbeddedTrainer<'a> {
    utterances: &'a [Utterance],
    worker: Option<Worker>,
    occupancy: Option<OccupancyReport>,
}

impl<'a> EmbeddedTrainer<'a> {
    pub fn new(utterances: &'a [Utterance]) -> Self {
        Self {
            utterances,
            worker: None,
            occupancy: None,
        }
    }

    /// Occupancy gathered by the most recent pass.
    pub fn occupancy_report(&self) -> Option<&OccupancyReport> {
        self.occupancy.as_ref()
    }

    pub fn into_occupancy_report(self) -> Option<OccupancyReport> {
        self.occupancy
    }
}

fn process(
    set: &HmmSet,
    utterance: &Utterance,
    worker: &mut Worker,
    session: &TrainingSession,
    pass: &mut EmbeddedStats,
) -> Result<PatternOutcome> {
    if session.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let required = session.config().min_frames_per_pattern;
    let frames = utterance.pattern().len();
    if frames < required {
        let reason = SkipReason::TooShort { frames, required };
        warn!("skipping utterance '{}': {}", utterance.id(), reason);
        return Ok(PatternOutcome::Skipped(reason));
    }
    process_utterance(
        set,
        utterance,
        &mut worker.scratch,
        session,
        &mut pass.stats,
        &mut worker.local,
        &mut pass.tally,
    )
}

/// How many times the models sharing each pooled parameter occurred.
fn parameter_occurrences(set: &HmmSet, tally: &OccupancyTally) -> (Vec<usize>, Vec<usize>) {
    let mut transitions = vec![0; set.transitions().len()];
    let mut mixtures = vec![0; set.mixtures().len()];
    for (m, model) in set.models().iter().enumerate() {
        let n = tally.occurrences(m);
        transitions[model.transition()] += n;
        for &mix in model.mixtures() {
            mixtures[mix] += n;
        }
    }
    (transitions, mixtures)
}

/// Label of the first model using each pooled parameter, for messages.
fn parameter_names(set: &HmmSet) -> (Vec<String>, Vec<String>) {
    let mut transitions: Vec<String> = (0..set.transitions().len())
        .map(|t| format!("transition {}", t))
        .collect();
    let mut mixtures: Vec<String> = (0..set.mixtures().len())
        .map(|m| format!("mixture {}", m))
        .collect();
    let mut named_t = vec![false; transitions.len()];
    let mut named_m = vec![false; mixtures.len()];
    for model in set.models() {
        if !named_t[model.transition()] {
            transitions[model.transition()] = model.label().to_string();
            named_t[model.transition()] = true;
        }
        for (j, &mix) in model.mixtures().iter().enumerate() {
            if !named_m[mix] {
                mixtures[mix] = format!("{} state {}", model.label(), j + 1);
                named_m[mix] = true;
            }
        }
    }
    (transitions, mixtures)
}

impl EmTrainer for EmbeddedTrainer<'_> {
    type Model = HmmSet;
    type Stats = EmbeddedStats;

    fn label(&self) -> String {
        "embedded".to_string()
    }

    fn accumulate(
        &mut self,
        model: &HmmSet,
        session: &TrainingSession,
    ) -> Result<(EmbeddedStats, PassSummary)> {
        let config = session.config();
        let utterances = self.utterances;
        for utterance in utterances {
            if utterance.pattern().len() >= config.min_frames_per_pattern {
                validate_utterance(model, utterance)?;
            }
        }

        if config.parallel {
            use rayon::prelude::*;

            return utterances
                .par_iter()
                .try_fold(
                    || {
                        (
                            Worker::new(model, utterances),
                            EmbeddedStats::zeroed(model),
                            PassSummary::default(),
                        )
                    },
                    |(mut worker, mut stats, mut pass), utterance| {
                        let outcome = process(model, utterance, &mut worker, session, &mut stats)?;
                        pass.record(&outcome);
                        Ok::<_, Error>((worker, stats, pass))
                    },
                )
                .map(|worker| worker.map(|(_, stats, pass)| (stats, pass)))
                .try_reduce(
                    || (EmbeddedStats::zeroed(model), PassSummary::default()),
                    |(mut stats, mut pass), (other, other_pass)| {
                        stats.merge(&other);
                        pass.merge(&other_pass);
                        Ok((stats, pass))
                    },
                );
        }

        let worker = self
            .worker
            .get_or_insert_with(|| Worker::new(model, utterances));
        worker.local = Statistics::zeroed(model.transitions(), model.mixtures());
        let mut stats = EmbeddedStats::zeroed(model);
        let mut pass = PassSummary::default();
        for utterance in utterances {
            let outcome = process(model, utterance, worker, session, &mut stats)?;
            pass.record(&outcome);
        }
        Ok((stats, pass))
    }

    fn update(
        &mut self,
        model: &HmmSet,
        stats: EmbeddedStats,
        session: &TrainingSession,
    ) -> Result<(HmmSet, UpdateSummary)> {
        let config = session.config();
        let EmbeddedStats { stats, tally } = stats;
        let (trans_seen, mix_seen) = parameter_occurrences(model, &tally);
        let (trans_names, mix_names) = parameter_names(model);
        let mut summary = UpdateSummary::default();

        let transitions = model
            .transitions()
            .iter()
            .zip(&stats.transitions)
            .enumerate()
            .map(|(t, (prior, acc))| {
                if trans_seen[t] < config.min_label_occurrences {
                    if trans_seen[t] > 0 {
                        warn!(
                            "'{}': seen {} times, keeping prior transitions",
                            trans_names[t], trans_seen[t]
                        );
                    }
                    summary.retained_parameters += 1;
                    return Ok(prior.clone());
                }
                reestimate_transitions(
                    &trans_names[t],
                    prior,
                    acc,
                    config.occupancy_policy,
                    &mut summary,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mixtures = model
            .mixtures()
            .iter()
            .zip(&stats.mixtures)
            .enumerate()
            .map(|(m, (prior, acc))| {
                if mix_seen[m] < config.min_label_occurrences {
                    debug!(
                        "'{}': seen {} times, keeping prior mixture",
                        mix_names[m], mix_seen[m]
                    );
                    summary.retained_parameters += 1;
                    return Ok(prior.clone());
                }
                reestimate_mixture(&mix_names[m], prior, acc, config, &mut summary)
            })
            .collect::<Result<Vec<_>>>()?;

        self.occupancy = Some(OccupancyReport::from_tally(model, &tally));
        Ok((model.with_parameters(transitions, mixtures)?, summary))
    }
}

/// Train `set` on `utterances` until convergence.
///
/// Returns the trained set together with the occupancy report of the last
/// pass.
///
/// # Errors
///
/// `ConsecutiveTeeModels` or `UntraversableUtterance` for an unusable
/// transcription, `Exhausted` when no utterance survives a pass, plus any
/// fatal error of the E- or M-step.
pub fn train(
    set: HmmSet,
    utterances: &[Utterance],
    session: &TrainingSession,
) -> Result<(Trained<HmmSet>, OccupancyReport)> {
    let mut trainer = EmbeddedTrainer::new(utterances);
    let trained = iterate(&mut trainer, set, session)?;
    let occupancy = trainer.into_occupancy_report().unwrap_or_default();
    Ok((trained, occupancy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PruningConfig, TrainingConfig};
    use crate::model::{GaussianMixture, TransitionMatrix};
    use crate::pattern::Pattern;
    use approx::assert_relative_eq;
    use ndarray::{array, Array1, Axis};

    fn set() -> HmmSet {
        let mut set = HmmSet::new(1);
        let lr2 = set.add_transition(TransitionMatrix::left_to_right(2, 0.5).unwrap());
        let low = set
            .add_mixture(GaussianMixture::single(array![1.0], array![2.0]).unwrap())
            .unwrap();
        let mid = set
            .add_mixture(GaussianMixture::single(array![4.0], array![2.0]).unwrap())
            .unwrap();
        let high = set
            .add_mixture(GaussianMixture::single(array![9.0], array![2.0]).unwrap())
            .unwrap();
        set.add_model("lo", lr2, vec![low, mid]).unwrap();
        set.add_model("hi", lr2, vec![mid, high]).unwrap();
        set
    }

    fn utterance(id: &str, values: &[f64], models: Vec<usize>) -> Utterance {
        let frames = Array1::from(values.to_vec()).insert_axis(Axis(1));
        Utterance::new(id, Pattern::new(frames), models)
    }

    fn corpus() -> Vec<Utterance> {
        vec![
            utterance("u1", &[0.0, 0.2, 5.0, 4.8, 5.1, 10.0, 9.9], vec![0, 1]),
            utterance("u2", &[5.0, 5.2, 10.1, 0.1, 4.9, 5.0], vec![1, 0]),
            utterance("u3", &[0.1, 4.9, 5.0, 9.8, 10.2], vec![0, 1]),
            utterance("u4", &[-0.1, 5.1, 4.8, 10.0], vec![0, 1]),
        ]
    }

    #[test]
    fn test_training_improves_likelihood() {
        let utterances = corpus();
        let session = TrainingSession::new(TrainingConfig::default().with_max_iterations(10)).unwrap();
        let (trained, occupancy) = train(set(), &utterances, &session).unwrap();
        let passes = trained.report.iterations();
        assert!(passes.len() >= 2);
        assert!(passes.last().unwrap().pass.log_prob > passes[0].pass.log_prob);
        assert_eq!(passes[0].pass.accumulated, 4);

        let lo = occupancy.get("lo").unwrap();
        assert_eq!(lo.occurrences, 4);
        // every frame is explained by some state
        let total: f64 = occupancy.models.iter().flat_map(|m| m.states.iter()).sum();
        let frames: usize = utterances.iter().map(|u| u.pattern().len()).sum();
        assert_relative_eq!(total, frames as f64, epsilon = 1e-2);

        for matrix in trained.model.transitions() {
            for i in 0..matrix.exit() {
                assert_relative_eq!(matrix.prob().row(i).sum(), 1.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_rare_models_keep_their_parameters() {
        let mut models = set();
        let lr1 = models.add_transition(TransitionMatrix::left_to_right(1, 0.2).unwrap());
        models.add_model("rare", lr1, vec![0]).unwrap();
        let mut utterances = corpus();
        utterances.push(utterance("u5", &[0.0, 0.0, 5.0, 1.0, 9.0], vec![0, 2]));
        let session = TrainingSession::new(TrainingConfig::default().with_max_iterations(2)).unwrap();
        let (trained, _) = train(models.clone(), &utterances, &session).unwrap();
        assert_eq!(trained.model.transitions()[lr1], models.transitions()[lr1]);
        assert!(trained.report.iterations()[0].update.retained_parameters >= 1);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let utterances = corpus();
        let config = TrainingConfig::default()
            .with_max_iterations(3)
            .with_pruning(PruningConfig::disabled());
        let (sequential, _) =
            train(set(), &utterances, &TrainingSession::new(config.clone()).unwrap()).unwrap();
        let (parallel, _) = train(
            set(),
            &utterances,
            &TrainingSession::new(config.with_parallel(true)).unwrap(),
        )
        .unwrap();
        for (s, p) in sequential
            .report
            .iterations()
            .iter()
            .zip(parallel.report.iterations())
        {
            assert_relative_eq!(s.pass.log_prob, p.pass.log_prob, epsilon = 1e-9);
        }
        for (s, p) in sequential.model.mixtures().iter().zip(parallel.model.mixtures()) {
            assert_relative_eq!(
                s.components()[0].mean()[0],
                p.components()[0].mean()[0],
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn test_reused_trainer_matches_fresh_one() {
        let utterances = corpus();
        let session = TrainingSession::new(TrainingConfig::default()).unwrap();
        let mut trainer = EmbeddedTrainer::new(&utterances);
        let (first, _) = trainer.accumulate(&set(), &session).unwrap();
        let (moved, _) = trainer.update(&set(), first, &session).unwrap();
        assert_ne!(moved.mixtures()[0], set().mixtures()[0]);

        let (reused, reused_pass) = trainer.accumulate(&moved, &session).unwrap();
        let (fresh, fresh_pass) = EmbeddedTrainer::new(&utterances)
            .accumulate(&moved, &session)
            .unwrap();
        assert_relative_eq!(reused_pass.log_prob, fresh_pass.log_prob, epsilon = 1e-9);
        for (r, f) in reused.stats.mixtures.iter().zip(&fresh.stats.mixtures) {
            let (r, f) = (&r.components()[0], &f.components()[0]);
            assert_relative_eq!(r.occupancy(), f.occupancy(), epsilon = 1e-9);
            assert_relative_eq!(r.mean().unwrap()[0], f.mean().unwrap()[0], epsilon = 1e-9);
            assert_relative_eq!(
                r.variance().unwrap()[0],
                f.variance().unwrap()[0],
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn test_unprunable_utterance_is_skipped() {
        let mut utterances = corpus();
        // no mixture can explain the third frame under any beam
        utterances.push(utterance("outlier", &[0.0, 5.0, 1e7, 10.0], vec![0, 1]));
        let session = TrainingSession::new(TrainingConfig::default().with_max_iterations(3)).unwrap();
        let (trained, occupancy) = train(set(), &utterances, &session).unwrap();
        for iteration in trained.report.iterations() {
            assert_eq!(iteration.pass.pruning_failures, 1);
            assert_eq!(iteration.pass.accumulated, 4);
        }
        assert_eq!(trained.report.total_skipped(), trained.report.iterations().len());
        assert_eq!(occupancy.get("lo").unwrap().occurrences, 4);
    }

    #[test]
    fn test_bad_transcription_is_fatal() {
        let utterances = vec![utterance("tiny", &[0.0, 1.0, 2.0], vec![0, 1])];
        let session = TrainingSession::new(TrainingConfig::default()).unwrap();
        assert!(matches!(
            train(set(), &utterances, &session),
            Err(Error::UntraversableUtterance { min_duration: 4, frames: 3, .. })
        ));
    }
}
