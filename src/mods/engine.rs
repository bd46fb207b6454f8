//! The phased KMC driver. Owns the lattice state, the RNG and the vacancy
//! pool; reads the compiled network.

use crate::mods::{
    checkpoint::Checkpoint,
    compiler::CompiledNetwork,
    error::{KmcError, KmcResult},
    lattice::{Doping, Lattice, species_counts},
    phase::{PhaseKind, SimPhaseInfo},
    results::PhaseResults,
    structure::SpeciesId,
    vacancies::VacancyPool,
};
use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::{
    collections::BTreeMap,
    path::PathBuf,
    time::{Duration, Instant},
};

/// Consecutive blocked attempts after which a phase counts as stalled.
const STALL_LIMIT: u64 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initialized,
    Running(PhaseKind),
    Completed,
}

impl EngineState {
    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Uninitialized => "Uninitialized",
            EngineState::Initialized => "Initialized",
            EngineState::Running(kind) => kind.name(),
            EngineState::Completed => "Completed",
        }
    }

    fn allows(&self, to: EngineState) -> bool {
        use EngineState::*;
        match (*self, to) {
            (Uninitialized, Initialized) => true,
            (Initialized, Running(_)) | (Initialized, Completed) => true,
            (Running(from), Running(next)) => next > from,
            (Running(_), Completed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Blocked,
    Rejected,
    Accepted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub seed: u64,
    /// Monte Carlo steps per mobile atom; 0 disables the phase.
    pub prerun_mcsp: f64,
    pub dyn_norm_attempts: u64,
    pub dyn_norm_outliers: u64,
    pub main_mcsp: f64,
    /// Attempts between snapshots; 0 snapshots at phase boundaries only.
    pub checkpoint_interval: u64,
    /// Attempts between progress lines; 0 disables them.
    pub print_interval: u64,
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 1012,
            prerun_mcsp: 0.0,
            dyn_norm_attempts: 0,
            dyn_norm_outliers: 0,
            main_mcsp: 1.0,
            checkpoint_interval: 0,
            print_interval: 0,
            checkpoint_path: None,
        }
    }
}

#[derive(Debug)]
pub struct SimulationEngine {
    network: CompiledNetwork,
    lattice: Lattice,
    cfg: EngineConfig,
    state: EngineState,
    rng: ChaCha8Rng,
    pool: VacancyPool,
    initial: Box<[SpeciesId]>,
    info: Option<SimPhaseInfo>,
    checkpoint: Checkpoint,
    expected_counts: BTreeMap<SpeciesId, usize>,
    normalization: f64,
    results: Vec<PhaseResults>,
    phase_started: Instant,
}

impl SimulationEngine {
    pub fn new(network: CompiledNetwork, lattice: Lattice, cfg: EngineConfig) -> KmcResult<Self> {
        if cfg.prerun_mcsp < 0.0 || !cfg.prerun_mcsp.is_finite() {
            return Err(KmcError::invalid("PrerunMcsp", "must be finite and >= 0"));
        }
        if cfg.main_mcsp < 0.0 || !cfg.main_mcsp.is_finite() {
            return Err(KmcError::invalid("MainMcsp", "must be finite and >= 0"));
        }
        if cfg.dyn_norm_attempts > 0 && cfg.dyn_norm_outliers >= cfg.dyn_norm_attempts {
            return Err(KmcError::invalid("DynNormOutliers", "must be below DynNormAttempts"));
        }
        if lattice.stacks != network.stack_count() {
            return Err(KmcError::InvariantViolation(format!(
                "lattice has {} stacks, compiled network {}",
                lattice.stacks,
                network.stack_count()
            )));
        }

        let pool = VacancyPool::new(&network, lattice.size);
        let checkpoint = Checkpoint::new(cfg.seed, &lattice);
        Ok(Self {
            normalization: network.normalization,
            rng: ChaCha8Rng::seed_from_u64(cfg.seed),
            network,
            lattice,
            cfg,
            state: EngineState::Uninitialized,
            pool,
            initial: Box::new([]),
            info: None,
            checkpoint,
            expected_counts: BTreeMap::new(),
            results: Vec::new(),
            phase_started: Instant::now(),
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn network(&self) -> &CompiledNetwork {
        &self.network
    }

    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    pub fn normalization(&self) -> f64 {
        self.normalization
    }

    pub fn phase_info(&self) -> Option<&SimPhaseInfo> {
        self.info.as_ref()
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn vacancy_pool(&self) -> &VacancyPool {
        &self.pool
    }

    pub fn all_results(&self) -> &[PhaseResults] {
        &self.results
    }

    /// Results of a phase that reached its target.
    pub fn results(&self, kind: PhaseKind) -> KmcResult<&PhaseResults> {
        self.results
            .iter()
            .find(|r| r.kind == kind)
            .ok_or_else(|| KmcError::invalid("Results", format!("{} phase has not completed", kind.name())))
    }

    fn transition(&mut self, to: EngineState) -> KmcResult<()> {
        if !self.state.allows(to) {
            return Err(KmcError::IllegalTransition {
                from: self.state.name(),
                to: to.name(),
            });
        }
        debug!("engine state {} -> {}", self.state.name(), to.name());
        self.state = to;
        Ok(())
    }

    /// Populates the lattice from the seeded RNG.
    pub fn initialize(&mut self, dopings: &[Doping], vacancy_count: usize) -> KmcResult<()> {
        if self.state != EngineState::Uninitialized {
            return Err(KmcError::IllegalTransition {
                from: self.state.name(),
                to: EngineState::Initialized.name(),
            });
        }
        let occupation = self
            .lattice
            .populate(&self.network, dopings, vacancy_count, &mut self.rng)?;
        self.pool.rebuild(&occupation, self.lattice.stacks);
        if self.pool.is_empty() {
            return Err(KmcError::invalid("VacancyCount", "no vacancy sits on a site with active jumps"));
        }
        self.expected_counts = species_counts(&occupation);
        self.initial = occupation;
        self.transition(EngineState::Initialized)?;
        info!(
            "Engine initialized: {} vacancies, {} jump paths, normalization {:.5e}",
            self.pool.len(),
            self.pool.paths(),
            self.normalization
        );
        Ok(())
    }

    /// Continues from a checkpoint written by a run with the same
    /// configuration. The engine must be freshly initialized.
    pub fn resume(&mut self, checkpoint: Checkpoint) -> KmcResult<()> {
        if self.state != EngineState::Initialized {
            return Err(KmcError::IllegalTransition {
                from: self.state.name(),
                to: "Resume",
            });
        }
        checkpoint.validate(self.cfg.seed, &self.lattice, &self.network, &self.expected_counts)?;
        let Some(last) = checkpoint.last().cloned() else {
            info!("Checkpoint holds no phase, starting from the beginning");
            return Ok(());
        };

        for done in checkpoint.phases.iter().filter(|p| p.completed) {
            self.results
                .push(PhaseResults::from_phase(done, &self.network, &self.lattice, Duration::ZERO)?);
        }

        self.transition(EngineState::Running(last.kind))?;
        self.normalization = if last.completed {
            self.carried_normalization(&last)
        } else {
            last.normalization
        };
        self.rng.set_word_pos(last.rng_word_pos);
        self.pool.rebuild(&last.occupation, self.lattice.stacks);
        info!(
            "Resuming {} phase at {} steps / {} attempts",
            last.kind.name(),
            last.counters.steps,
            last.counters.attempts
        );
        self.info = Some(last);
        self.checkpoint = checkpoint;
        self.phase_started = Instant::now();
        Ok(())
    }

    fn is_enabled(&self, kind: PhaseKind) -> bool {
        match kind {
            PhaseKind::Prerun => self.cfg.prerun_mcsp > 0.0,
            PhaseKind::DynNorm => self.cfg.dyn_norm_attempts > 0,
            PhaseKind::Main => self.cfg.main_mcsp > 0.0,
        }
    }

    fn step_target(&self, mcsp: f64) -> u64 {
        let mobile = species_counts(&self.initial)
            .get(&self.network.mobile)
            .copied()
            .unwrap_or(0);
        ((mcsp * mobile as f64).round() as u64).max(1)
    }

    /// Moves to the next enabled phase, or to `Completed`. A phase that is
    /// running and not yet finished is kept.
    pub fn advance(&mut self) -> KmcResult<Option<PhaseKind>> {
        let after = match self.state {
            EngineState::Uninitialized => {
                return Err(KmcError::IllegalTransition {
                    from: self.state.name(),
                    to: PhaseKind::Prerun.name(),
                });
            }
            EngineState::Completed => return Ok(None),
            EngineState::Initialized => None,
            EngineState::Running(kind) => {
                if self.info.as_ref().is_some_and(|i| !i.completed) {
                    return Ok(Some(kind));
                }
                Some(kind)
            }
        };

        let next = PhaseKind::ALL
            .into_iter()
            .filter(|&k| after.is_none_or(|a| k > a))
            .find(|&k| self.is_enabled(k));

        match next {
            Some(kind) => {
                self.begin_phase(kind)?;
                Ok(Some(kind))
            }
            None => {
                self.transition(EngineState::Completed)?;
                info!("Simulation completed");
                Ok(None)
            }
        }
    }

    fn begin_phase(&mut self, kind: PhaseKind) -> KmcResult<()> {
        let (target_steps, target_attempts) = match kind {
            PhaseKind::Prerun => (self.step_target(self.cfg.prerun_mcsp), 0),
            PhaseKind::DynNorm => (0, self.cfg.dyn_norm_attempts),
            PhaseKind::Main => (self.step_target(self.cfg.main_mcsp), 0),
        };
        self.transition(EngineState::Running(kind))?;

        let occupation = match self.info.take() {
            Some(previous) => previous.occupation,
            None => self.initial.clone(),
        };
        self.pool.rebuild(&occupation, self.lattice.stacks);
        if self.pool.is_empty() {
            return Err(KmcError::invalid("VacancyCount", "no vacancy sits on a site with active jumps"));
        }

        let mut info = SimPhaseInfo::new(kind, target_steps, target_attempts, self.normalization, occupation);
        info.rng_word_pos = self.rng.get_word_pos();
        info!(
            "{} phase started: target {} steps / {} attempts, normalization {:.5e}",
            kind.name(),
            target_steps,
            target_attempts,
            self.normalization
        );
        self.info = Some(info);
        self.phase_started = Instant::now();
        Ok(())
    }

    /// One attempt in the running phase. The attempt that reaches the target
    /// completes the phase; stepping a completed phase is an error.
    pub fn step(&mut self) -> KmcResult<AttemptOutcome> {
        let EngineState::Running(kind) = self.state else {
            return Err(KmcError::IllegalTransition {
                from: self.state.name(),
                to: "Step",
            });
        };
        let Some(mut info) = self.info.take() else {
            return Err(KmcError::InvariantViolation(format!(
                "{} phase without phase state",
                kind.name()
            )));
        };
        if info.completed || info.is_target_reached() {
            self.info = Some(info);
            return Err(KmcError::IllegalTransition {
                from: "PhaseCompleted",
                to: "Step",
            });
        }
        let outcome = attempt(&self.network, &self.lattice, &mut self.pool, &mut self.rng, &mut info);
        let result = if info.is_target_reached() {
            self.finish_phase(&mut info)
        } else {
            Ok(())
        };
        self.info = Some(info);
        result.map(|_| outcome)
    }

    /// Runs the current phase to its target.
    pub fn run_phase(&mut self) -> KmcResult<()> {
        self.run_attempts(u64::MAX).map(|_| ())
    }

    /// Runs at most `max` attempts of the current phase and returns whether
    /// the phase reached its target.
    pub fn run_attempts(&mut self, max: u64) -> KmcResult<bool> {
        let Some(mut info) = self.info.take() else {
            return Err(KmcError::IllegalTransition {
                from: self.state.name(),
                to: "Run",
            });
        };
        let result = self.drive(&mut info, max);
        let completed = info.completed;
        self.info = Some(info);
        result.map(|_| completed)
    }

    fn drive(&mut self, info: &mut SimPhaseInfo, max: u64) -> KmcResult<()> {
        if info.completed {
            return Ok(());
        }
        let snapshot_every = self.cfg.checkpoint_interval;
        let print_every = self.cfg.print_interval;
        let mut blocked_run = 0u64;
        let mut budget = max;

        while !info.is_target_reached() {
            if budget == 0 {
                return Ok(());
            }
            budget -= 1;
            match attempt(&self.network, &self.lattice, &mut self.pool, &mut self.rng, info) {
                AttemptOutcome::Blocked => {
                    blocked_run += 1;
                    if blocked_run >= STALL_LIMIT {
                        return Err(KmcError::InvariantViolation(format!(
                            "{} phase stalled: {} consecutive blocked attempts",
                            info.kind.name(),
                            blocked_run
                        )));
                    }
                }
                _ => blocked_run = 0,
            }

            let attempts = info.counters.attempts;
            if snapshot_every > 0 && attempts % snapshot_every == 0 {
                self.snapshot(info)?;
            }
            if print_every > 0 && attempts % print_every == 0 {
                info!(
                    "{}: {:.1}% ({} steps, {} attempts, {} blocked)",
                    info.kind.name(),
                    info.progress() * 100.0,
                    info.counters.steps,
                    attempts,
                    info.counters.blocked
                );
            }
        }
        self.finish_phase(info)
    }

    fn finish_phase(&mut self, info: &mut SimPhaseInfo) -> KmcResult<()> {
        info.completed = true;
        let runtime = self.phase_started.elapsed();
        let c = info.counters;
        if c.overkill > 0 || c.nonsense > 0 {
            warn!(
                "{} phase: {} overkill and {} nonsense attempts, normalization {:.5e} is too small",
                info.kind.name(),
                c.overkill,
                c.nonsense,
                info.normalization
            );
        }

        let carried = self.carried_normalization(info);
        if carried != info.normalization {
            info!(
                "{} phase: normalization {:.5e} -> {:.5e} for later phases",
                info.kind.name(),
                info.normalization,
                carried
            );
        }
        self.normalization = carried;

        let results = PhaseResults::from_phase(info, &self.network, &self.lattice, runtime)?;
        self.results.retain(|r| r.kind != info.kind);
        self.results.push(results);
        self.snapshot(info)?;
        info!(
            "{} phase done: {} steps, {} attempts (Time: {:?})",
            info.kind.name(),
            c.steps,
            c.attempts,
            runtime
        );
        Ok(())
    }

    /// Normalization that brings the largest sampled probability, outliers
    /// discarded, to one.
    fn calibrate(&self, info: &SimPhaseInfo) -> f64 {
        match info.attempted.max_after_discarding(self.cfg.dyn_norm_outliers) {
            Some(max) if max > 0.0 => info.normalization * max,
            _ => info.normalization,
        }
    }

    /// Normalization the phases after a completed one run with. Dynamic
    /// normalization calibrates it; a prerun with overkill raises it until
    /// every probability it sampled stays at or below one.
    fn carried_normalization(&self, info: &SimPhaseInfo) -> f64 {
        match info.kind {
            PhaseKind::DynNorm => self.calibrate(info),
            PhaseKind::Prerun if info.counters.overkill > 0 => match info.attempted.max() {
                Some(max) if max > 1.0 && max.is_finite() => info.normalization * max,
                _ => info.normalization,
            },
            _ => info.normalization,
        }
    }

    /// Records the phase state and reorders the vacancy pool canonically, so
    /// a run resumed from this point draws the same sequence.
    fn snapshot(&mut self, info: &mut SimPhaseInfo) -> KmcResult<()> {
        info.rng_word_pos = self.rng.get_word_pos();
        self.pool.rebuild(&info.occupation, self.lattice.stacks);
        self.checkpoint.upsert(info.clone());
        if let Some(path) = &self.cfg.checkpoint_path {
            self.checkpoint.save(path)?;
        }
        Ok(())
    }

    /// Runs every remaining phase.
    pub fn run(&mut self) -> KmcResult<()> {
        while self.advance()?.is_some() {
            self.run_phase()?;
        }
        Ok(())
    }
}

/// One KMC attempt: pick a vacancy and a direction, evaluate the jump of the
/// neighboring mobile atom into the vacancy and accept it with its
/// normalized probability.
#[inline(always)]
fn attempt(
    network: &CompiledNetwork,
    lattice: &Lattice,
    pool: &mut VacancyPool,
    rng: &mut ChaCha8Rng,
    info: &mut SimPhaseInfo,
) -> AttemptOutcome {
    let norm = info.normalization;
    let (site, direction) = pool.select(rng);
    let stack = lattice.stack_of(site);
    let jump = &network.jumps[network.jump_index(stack, direction)];
    let dest = lattice.offset(site, &jump.dest);

    info.counters.attempts += 1;
    info.sim_time += 1.0 / (network.attempt_frequency * norm * pool.paths() as f64);

    let occupation = &info.occupation;
    if occupation[dest] != network.mobile {
        info.counters.blocked += 1;
        return AttemptOutcome::Blocked;
    }

    let p = network.jump_factor(jump, |rel| occupation[lattice.offset(site, rel)]) / norm;
    let back = &network.jumps[jump.backjump];
    let p_back = network.jump_factor(back, |rel| occupation[lattice.offset(dest, rel)]) / norm;
    info.attempted.record(p);
    // Overkill is accepted with certainty; the excess rate is lost.
    if !(p <= 1.0) {
        info.counters.overkill += 1;
    }
    if !(p_back <= 1.0) {
        info.counters.nonsense += 1;
    }

    if rng.random::<f64>() >= p.min(1.0) {
        return AttemptOutcome::Rejected;
    }

    info.occupation.swap(site, dest);
    info.displacement.swap(site, dest);
    info.displacement[site] += jump.displacement;
    pool.relocate(site, dest, lattice.stack_of(dest));
    info.accepted.record(p);
    info.counters.steps += 1;
    AttemptOutcome::Accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mods::{
        classifier::ClassifiedNetwork,
        compiler::CompileParams,
        congruence::Tolerance,
        constants::VACANCY,
        geometry::Vec3,
        jumps::{JumpCollection, ShellConfig},
        structure::{SpeciesTable, tests::simple_cubic},
    };

    fn cubic(activation: f64) -> CompiledNetwork {
        cubic_with(activation, 0.05)
    }

    fn cubic_with(activation: f64, vacancy_neighbor: f64) -> CompiledNetwork {
        let cell = simple_cubic(1.0);
        let mut species = SpeciesTable::new();
        species.add(1, "Na", 1.0).expect("species");
        let jumps = JumpCollection::build(&cell, 1, ShellConfig::default()).expect("build");
        let mut network = ClassifiedNetwork::classify(&cell, jumps, Tolerance::default()).expect("classify");
        network.set_activation_energy(0, activation).expect("energy");
        network
            .set_unique_coordinate_energy(0, 0, VACANCY, vacancy_neighbor)
            .expect("energy");
        let params = CompileParams {
            temperature: 800.0,
            attempt_frequency: 1.0e13,
            field_direction: Vec3::new(0.0, 0.0, 1.0),
            field_magnitude: 0.0,
        };
        CompiledNetwork::compile(&network, &cell, &species, params).expect("compile")
    }

    fn engine(cfg: EngineConfig, vacancies: usize) -> SimulationEngine {
        let network = cubic(0.2);
        let lattice = Lattice::new(4, 4, 4, 1).expect("lattice");
        let mut engine = SimulationEngine::new(network, lattice, cfg).expect("engine");
        engine.initialize(&[], vacancies).expect("initialize");
        engine
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        use EngineState::*;
        assert!(Uninitialized.allows(Initialized));
        assert!(Initialized.allows(Running(PhaseKind::Main)));
        assert!(Running(PhaseKind::Prerun).allows(Running(PhaseKind::Main)));
        assert!(!Running(PhaseKind::Main).allows(Running(PhaseKind::Prerun)));
        assert!(!Running(PhaseKind::Main).allows(Running(PhaseKind::Main)));
        assert!(!Completed.allows(Running(PhaseKind::Main)));
        assert!(!Uninitialized.allows(Running(PhaseKind::Prerun)));
    }

    #[test]
    fn stepping_before_initialization_is_illegal() {
        let lattice = Lattice::new(2, 2, 2, 1).expect("lattice");
        let mut engine = SimulationEngine::new(cubic(0.2), lattice, EngineConfig::default()).expect("engine");
        let err = engine.step().unwrap_err();
        assert!(matches!(err, KmcError::IllegalTransition { .. }));
        assert!(engine.advance().is_err());
    }

    #[test]
    fn disabled_phases_are_skipped() {
        let cfg = EngineConfig {
            main_mcsp: 2.0,
            ..EngineConfig::default()
        };
        let mut engine = engine(cfg, 3);
        assert_eq!(engine.advance().expect("advance"), Some(PhaseKind::Main));
        engine.run_phase().expect("run");
        assert_eq!(engine.advance().expect("advance"), None);
        assert_eq!(engine.state(), EngineState::Completed);
        assert!(engine.results(PhaseKind::Prerun).is_err());
        let main = engine.results(PhaseKind::Main).expect("results");
        assert_eq!(main.counters.steps, 2 * 61);
    }

    #[test]
    fn accepted_jumps_conserve_species_and_track_the_pool() {
        let cfg = EngineConfig {
            main_mcsp: 1.0,
            ..EngineConfig::default()
        };
        let mut engine = engine(cfg, 5);
        engine.run().expect("run");
        let info = engine.phase_info().expect("info");
        let counts = species_counts(&info.occupation);
        assert_eq!(counts.get(&VACANCY), Some(&5));
        assert_eq!(engine.vacancy_pool().len(), 5);
        for (idx, &s) in info.occupation.iter().enumerate() {
            assert_eq!(engine.vacancy_pool().contains(idx), s == VACANCY);
            if s == VACANCY {
                assert_eq!(info.displacement[idx], Vec3::ZERO);
            }
        }
        let c = info.counters;
        assert_eq!(c.steps, 59);
        assert!(c.attempts >= c.steps + c.blocked);
        assert!(info.sim_time > 0.0);
    }

    #[test]
    fn dynamic_normalization_tightens_the_bound() {
        let cfg = EngineConfig {
            dyn_norm_attempts: 2_000,
            dyn_norm_outliers: 0,
            main_mcsp: 3.0,
            ..EngineConfig::default()
        };
        let mut engine = engine(cfg, 6);
        let analytic = engine.normalization();
        engine.run().expect("run");
        assert!(engine.normalization() <= analytic);
        let main = engine.checkpoint().phase(PhaseKind::Main).expect("main");
        assert_eq!(main.normalization, engine.normalization());
        let dyn_norm = engine.checkpoint().phase(PhaseKind::DynNorm).expect("dyn norm");
        let sampled = dyn_norm.attempted.max().expect("samples");
        assert!((sampled * dyn_norm.normalization / engine.normalization() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn identical_seeds_give_identical_runs() {
        let cfg = EngineConfig {
            prerun_mcsp: 1.0,
            main_mcsp: 2.0,
            checkpoint_interval: 50,
            ..EngineConfig::default()
        };
        let mut a = engine(cfg.clone(), 4);
        let mut b = engine(cfg, 4);
        a.run().expect("run");
        b.run().expect("run");
        assert_eq!(a.phase_info(), b.phase_info());
        assert_eq!(a.checkpoint(), b.checkpoint());
    }

    #[test]
    fn overkill_is_clamped_and_raises_the_normalization() {
        let mut network = cubic_with(0.2, 0.0);
        let analytic = network.normalization;
        network.normalization = analytic * 0.25;
        let lattice = Lattice::new(4, 4, 4, 1).expect("lattice");
        let cfg = EngineConfig {
            prerun_mcsp: 1.0,
            main_mcsp: 1.0,
            ..EngineConfig::default()
        };
        let mut engine = SimulationEngine::new(network, lattice, cfg).expect("engine");
        engine.initialize(&[], 4).expect("initialize");
        engine.run().expect("run");

        let prerun = engine.results(PhaseKind::Prerun).expect("prerun");
        let c = prerun.counters;
        let evaluated = c.attempts - c.blocked;
        assert!(evaluated > 0);
        assert_eq!(c.overkill, evaluated);
        assert_eq!(c.nonsense, evaluated);
        assert_eq!(c.steps, evaluated);
        assert_eq!(prerun.overkill_fraction, 1.0);
        assert!((prerun.max_probability / 4.0 - 1.0).abs() < 2e-3);

        assert!((engine.normalization() / analytic - 1.0).abs() < 2e-3);
        let main = engine.results(PhaseKind::Main).expect("main");
        assert_eq!(main.normalization, engine.normalization());
        assert_eq!(main.counters.overkill, 0);
        assert_eq!(main.overkill_fraction, 0.0);
    }

    #[test]
    fn stepping_to_the_target_completes_the_phase() {
        let cfg = EngineConfig {
            main_mcsp: 0.05,
            ..EngineConfig::default()
        };
        let mut engine = engine(cfg, 2);
        assert_eq!(engine.advance().expect("advance"), Some(PhaseKind::Main));
        let target = engine.phase_info().expect("info").target_steps;
        assert_eq!(target, 3);

        let mut guard = 0;
        while !engine.phase_info().expect("info").completed {
            engine.step().expect("step");
            guard += 1;
            assert!(guard < 1_000_000, "phase never completed");
        }
        let info = engine.phase_info().expect("info");
        assert_eq!(info.counters.steps, target);
        assert!(engine.results(PhaseKind::Main).is_ok());
        assert_eq!(engine.checkpoint().phase(PhaseKind::Main).map(|p| p.completed), Some(true));

        let err = engine.step().unwrap_err();
        assert!(matches!(err, KmcError::IllegalTransition { to: "Step", .. }));
        assert_eq!(engine.phase_info().expect("info").counters.steps, target);
        assert_eq!(engine.advance().expect("advance"), None);
    }
}
