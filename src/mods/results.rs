use crate::mods::{
    compiler::CompiledNetwork,
    constants::{ELEMENTARY_CHARGE, PER_ANGSTROM_TO_PER_CM},
    error::{KmcError, KmcResult},
    geometry::Vec3,
    lattice::Lattice,
    phase::{PhaseCounters, PhaseKind, SimPhaseInfo},
};
use std::time::Duration;

const ANGSTROM2_TO_CM2: f64 = 1.0e-16;

/// Mean squared displacement per mobile atom in Angstrom^2.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Msd {
    pub total: f64,
    pub parallel: f64,
    pub perpendicular: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhaseResults {
    pub kind: PhaseKind,
    pub mobile_count: usize,
    pub counters: PhaseCounters,
    pub sim_time: f64,
    pub normalization: f64,
    /// Share of evaluated attempts whose probability exceeded one and was
    /// clamped to certain acceptance.
    pub overkill_fraction: f64,
    /// Largest attempted probability, as the upper edge of its histogram bin.
    pub max_probability: f64,
    pub msd: Msd,
    /// Mean displacement along the field direction, Angstrom.
    pub drift: f64,
    /// cm^2/s
    pub diffusion: f64,
    /// S/cm
    pub conductivity: f64,
    pub runtime: Duration,
}

impl PhaseResults {
    pub fn from_phase(
        info: &SimPhaseInfo,
        network: &CompiledNetwork,
        lattice: &Lattice,
        runtime: Duration,
    ) -> KmcResult<Self> {
        if !info.completed {
            return Err(KmcError::invalid(
                "Results",
                format!("{} phase has not reached its target", info.kind.name()),
            ));
        }

        let axis = network.field_unit;
        let mut sum = Msd::default();
        let mut drift = 0.0;
        let mut mobile_count = 0;
        for (&s, d) in info.occupation.iter().zip(info.displacement.iter()) {
            if s != network.mobile {
                continue;
            }
            mobile_count += 1;
            let along = d.dot(&axis);
            sum.total += d.length_sq();
            sum.parallel += along * along;
            drift += along;
        }

        let evaluated = info.counters.attempts - info.counters.blocked;
        let mut results = Self {
            kind: info.kind,
            mobile_count,
            counters: info.counters,
            sim_time: info.sim_time,
            normalization: info.normalization,
            overkill_fraction: if evaluated > 0 {
                info.counters.overkill as f64 / evaluated as f64
            } else {
                0.0
            },
            max_probability: info.attempted.max().unwrap_or(0.0),
            msd: Msd::default(),
            drift: 0.0,
            diffusion: 0.0,
            conductivity: 0.0,
            runtime,
        };
        if mobile_count == 0 {
            return Ok(results);
        }

        let n = mobile_count as f64;
        results.msd = Msd {
            total: sum.total / n,
            parallel: sum.parallel / n,
            perpendicular: (sum.total - sum.parallel) / n,
        };
        results.drift = drift / n;

        if info.sim_time > 0.0 {
            results.diffusion = results.msd.total / (6.0 * info.sim_time) * ANGSTROM2_TO_CM2;

            let volume = supercell_volume(network.cell_vectors, lattice);
            let density = n / volume;
            let charge = network.charge * ELEMENTARY_CHARGE;
            // S/Angstrom
            let sigma = if network.field_magnitude > 0.0 {
                let velocity = results.drift / info.sim_time;
                density * charge * velocity / network.field_magnitude
            } else {
                let diffusion = results.msd.total / (6.0 * info.sim_time);
                density * charge * charge * diffusion / (network.kt * ELEMENTARY_CHARGE)
            };
            results.conductivity = sigma * PER_ANGSTROM_TO_PER_CM;
        }
        Ok(results)
    }
}

fn supercell_volume(vectors: [Vec3; 3], lattice: &Lattice) -> f64 {
    let [a, b, c] = vectors;
    a.dot(&b.cross(&c)).abs() * (lattice.nx * lattice.ny * lattice.nz) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mods::{
        classifier::ClassifiedNetwork,
        compiler::CompileParams,
        congruence::Tolerance,
        constants::VACANCY,
        jumps::{JumpCollection, ShellConfig},
        structure::{SpeciesTable, tests::simple_cubic},
    };

    fn network(field: f64) -> CompiledNetwork {
        let cell = simple_cubic(2.0);
        let mut species = SpeciesTable::new();
        species.add(1, "Li", 1.0).expect("species");
        let jumps = JumpCollection::build(&cell, 1, ShellConfig::default()).expect("build");
        let classified = ClassifiedNetwork::classify(&cell, jumps, Tolerance::default()).expect("classify");
        let params = CompileParams {
            temperature: 1000.0,
            attempt_frequency: 1.0e13,
            field_direction: Vec3::new(1.0, 0.0, 0.0),
            field_magnitude: field,
        };
        CompiledNetwork::compile(&classified, &cell, &species, params).expect("compile")
    }

    fn finished(occupation: Vec<u8>, displacement: Vec<Vec3>) -> SimPhaseInfo {
        let mut info = SimPhaseInfo::new(PhaseKind::Main, 1, 0, 1.0, occupation.into_boxed_slice());
        info.displacement = displacement.into_boxed_slice();
        info.sim_time = 1.0e-9;
        info.completed = true;
        info
    }

    #[test]
    fn incomplete_phase_has_no_results() {
        let net = network(0.0);
        let lattice = Lattice::new(1, 1, 2, 1).expect("lattice");
        let mut info = finished(vec![1, VACANCY], vec![Vec3::ZERO; 2]);
        info.completed = false;
        assert!(PhaseResults::from_phase(&info, &net, &lattice, Duration::ZERO).is_err());
    }

    #[test]
    fn msd_splits_along_field_axis() {
        let net = network(0.0);
        let lattice = Lattice::new(1, 2, 2, 1).expect("lattice");
        let info = finished(
            vec![1, 1, VACANCY, 1],
            vec![
                Vec3::new(2.0, 0.0, 0.0),
                Vec3::new(0.0, 2.0, 0.0),
                Vec3::new(9.0, 9.0, 9.0),
                Vec3::new(2.0, 2.0, 0.0),
            ],
        );
        let r = PhaseResults::from_phase(&info, &net, &lattice, Duration::ZERO).expect("results");
        assert_eq!(r.mobile_count, 3);
        assert!((r.msd.total - 16.0 / 3.0).abs() < 1e-12);
        assert!((r.msd.parallel - 8.0 / 3.0).abs() < 1e-12);
        assert!((r.msd.perpendicular - 8.0 / 3.0).abs() < 1e-12);
        assert!((r.diffusion - 16.0 / 3.0 / 6.0e-9 * 1e-16).abs() < 1e-20);
        assert!(r.conductivity > 0.0);
    }

    #[test]
    fn overkill_share_counts_only_evaluated_attempts() {
        let net = network(0.0);
        let lattice = Lattice::new(1, 1, 2, 1).expect("lattice");
        let mut info = finished(vec![1, VACANCY], vec![Vec3::ZERO; 2]);
        info.counters.attempts = 10;
        info.counters.blocked = 2;
        info.counters.overkill = 2;
        info.attempted.insert(1.5, 2);
        info.attempted.insert(0.5, 6);
        let r = PhaseResults::from_phase(&info, &net, &lattice, Duration::ZERO).expect("results");
        assert_eq!(r.overkill_fraction, 0.25);
        assert_eq!(r.max_probability, 1.5);
    }

    #[test]
    fn drift_against_field_gives_no_positive_conductivity() {
        let net = network(0.01);
        let lattice = Lattice::new(1, 1, 2, 1).expect("lattice");
        let with = finished(vec![1, 1], vec![Vec3::new(2.0, 0.0, 0.0); 2]);
        let against = finished(vec![1, 1], vec![Vec3::new(-2.0, 0.0, 0.0); 2]);
        let a = PhaseResults::from_phase(&with, &net, &lattice, Duration::ZERO).expect("results");
        let b = PhaseResults::from_phase(&against, &net, &lattice, Duration::ZERO).expect("results");
        assert!(a.conductivity > 0.0);
        assert!((a.conductivity + b.conductivity).abs() < 1e-12 * a.conductivity.abs());
        assert!((a.drift - 2.0).abs() < 1e-12);
    }
}
