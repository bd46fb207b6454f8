use crate::mods::{
    compiler::CompiledNetwork,
    constants::VACANCY,
    error::{KmcError, KmcResult},
    geometry::LatticePos,
    structure::SpeciesId,
};
use log::{debug, info};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

/// Substitution of `count` host atoms by a dopant. Each dopant removes
/// `vacancies_per_dopant` mobile atoms for charge compensation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Doping {
    pub dopant: SpeciesId,
    pub host: SpeciesId,
    pub count: usize,
    pub vacancies_per_dopant: f64,
}

/// Periodic supercell of `nx * ny * nz` unit cells with `stacks` sites each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lattice {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub stacks: usize,
    pub size: usize,
    size_zs: usize,
    size_yzs: usize,
}

impl Lattice {
    pub fn new(nx: usize, ny: usize, nz: usize, stacks: usize) -> KmcResult<Self> {
        if nx == 0 || ny == 0 || nz == 0 {
            return Err(KmcError::invalid("Sx/Sy/Sz", "must be > 0"));
        }
        if stacks == 0 {
            return Err(KmcError::Structure("unit cell without sites".to_string()));
        }
        let size_zs = nz * stacks;
        let size_yzs = ny * size_zs;
        Ok(Self {
            nx,
            ny,
            nz,
            stacks,
            size: nx * size_yzs,
            size_zs,
            size_yzs,
        })
    }

    #[inline(always)]
    pub fn xyzs_to_idx(&self, x: usize, y: usize, z: usize, s: usize) -> usize {
        s + z * self.stacks + y * self.size_zs + x * self.size_yzs
    }

    #[inline(always)]
    pub fn idx_to_xyzs(&self, idx: usize) -> (usize, usize, usize, usize) {
        let s = idx % self.stacks;
        let z = (idx / self.stacks) % self.nz;
        let y = (idx / self.size_zs) % self.ny;
        let x = idx / self.size_yzs;
        (x, y, z, s)
    }

    #[inline(always)]
    pub fn stack_of(&self, idx: usize) -> usize {
        idx % self.stacks
    }

    #[inline(always)]
    fn xyz_to_periodic_sub(coord: isize, dim_size: usize) -> usize {
        let dim = dim_size as isize;
        if (0..dim).contains(&coord) {
            coord as usize
        } else {
            coord.rem_euclid(dim) as usize
        }
    }

    /// Site reached from `idx` by the relative position `rel`.
    #[inline(always)]
    pub fn offset(&self, idx: usize, rel: &LatticePos) -> usize {
        let (x, y, z, _) = self.idx_to_xyzs(idx);
        self.xyzs_to_idx(
            Self::xyz_to_periodic_sub(x as isize + rel.x as isize, self.nx),
            Self::xyz_to_periodic_sub(y as isize + rel.y as isize, self.ny),
            Self::xyz_to_periodic_sub(z as isize + rel.z as isize, self.nz),
            rel.s,
        )
    }

    /// Host occupation with dopants and vacancies placed at random.
    pub fn populate(
        &self,
        network: &CompiledNetwork,
        dopings: &[Doping],
        vacancy_count: usize,
        rng: &mut ChaCha8Rng,
    ) -> KmcResult<Box<[SpeciesId]>> {
        if network.stack_count() != self.stacks {
            return Err(KmcError::InvariantViolation(format!(
                "lattice has {} stacks, compiled network {}",
                self.stacks,
                network.stack_count()
            )));
        }
        let mut occupation: Box<[SpeciesId]> = (0..self.size)
            .map(|idx| network.stack_species[self.stack_of(idx)])
            .collect();

        let mut compensation = 0.0;
        for doping in dopings {
            let placed = self.substitute(&mut occupation, network, doping.host, doping.dopant, doping.count, rng)?;
            compensation += placed as f64 * doping.vacancies_per_dopant;
            debug!("doped {} sites of {} with {}", placed, doping.host, doping.dopant);
        }

        let vacancies = vacancy_count + compensation.round() as usize;
        self.substitute(&mut occupation, network, network.mobile, VACANCY, vacancies, rng)?;

        info!(
            "Lattice {}x{}x{} with {} sites populated: {} vacancies",
            self.nx, self.ny, self.nz, self.size, vacancies
        );
        Ok(occupation)
    }

    fn substitute(
        &self,
        occupation: &mut [SpeciesId],
        network: &CompiledNetwork,
        from: SpeciesId,
        to: SpeciesId,
        count: usize,
        rng: &mut ChaCha8Rng,
    ) -> KmcResult<usize> {
        let mut candidates: Vec<usize> = (0..self.size)
            .filter(|&idx| {
                occupation[idx] == from && network.stack_occupants[self.stack_of(idx)].contains(&to)
            })
            .collect();
        if count > candidates.len() {
            return Err(KmcError::invalid(
                if to == VACANCY { "VacancyCount" } else { "Doping" },
                format!(
                    "{} sites of species {} requested, {} available",
                    count,
                    from,
                    candidates.len()
                ),
            ));
        }
        for i in 0..count {
            let j = rng.random_range(i..candidates.len());
            candidates.swap(i, j);
            occupation[candidates[i]] = to;
        }
        Ok(count)
    }

    /// Every site carries a species its stack admits.
    pub fn check_occupation(&self, occupation: &[SpeciesId], network: &CompiledNetwork) -> KmcResult<()> {
        if occupation.len() != self.size {
            return Err(KmcError::CheckpointMismatch(format!(
                "occupation of {} sites for a lattice of {}",
                occupation.len(),
                self.size
            )));
        }
        for (idx, &species) in occupation.iter().enumerate() {
            let stack = self.stack_of(idx);
            if species != network.stack_species[stack] && !network.stack_occupants[stack].contains(&species) {
                return Err(KmcError::CheckpointMismatch(format!(
                    "site {} of stack {} holds species {}",
                    idx, stack, species
                )));
            }
        }
        Ok(())
    }
}

pub fn species_counts(occupation: &[SpeciesId]) -> BTreeMap<SpeciesId, usize> {
    let mut counts = BTreeMap::new();
    for &s in occupation {
        *counts.entry(s).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mods::{
        classifier::ClassifiedNetwork,
        compiler::CompileParams,
        congruence::Tolerance,
        geometry::Vec3,
        jumps::{JumpCollection, ShellConfig},
        structure::{CellAtom, SpeciesTable, UnitCell},
    };
    use rand::SeedableRng;

    fn doped_network() -> CompiledNetwork {
        // mobile sites at the corner, a host site that admits a dopant at the body center
        let cell = UnitCell::new(
            UnitCell::vectors_from_parameters(2.0, 2.0, 2.0, 90.0, 90.0, 90.0),
            vec![
                CellAtom {
                    frac: Vec3::ZERO,
                    species: 1,
                    occupants: vec![1, VACANCY],
                },
                CellAtom {
                    frac: Vec3::new(0.5, 0.5, 0.5),
                    species: 2,
                    occupants: vec![2, 3],
                },
            ],
            1e-6,
        )
        .expect("cell");
        let mut species = SpeciesTable::new();
        species.add(1, "O", -2.0).expect("species");
        species.add(2, "Zr", 4.0).expect("species");
        species.add(3, "Y", 3.0).expect("species");
        let jumps = JumpCollection::build(&cell, 1, ShellConfig::default()).expect("build");
        let network = ClassifiedNetwork::classify(&cell, jumps, Tolerance::default()).expect("classify");
        let params = CompileParams {
            temperature: 1000.0,
            attempt_frequency: 1.0e13,
            field_direction: Vec3::new(0.0, 0.0, 1.0),
            field_magnitude: 0.0,
        };
        CompiledNetwork::compile(&network, &cell, &species, params).expect("compile")
    }

    #[test]
    fn index_round_trip() {
        let lattice = Lattice::new(3, 4, 5, 2).expect("lattice");
        for idx in 0..lattice.size {
            let (x, y, z, s) = lattice.idx_to_xyzs(idx);
            assert_eq!(lattice.xyzs_to_idx(x, y, z, s), idx);
        }
    }

    #[test]
    fn offsets_wrap_periodically() {
        let lattice = Lattice::new(3, 3, 3, 2).expect("lattice");
        let origin = lattice.xyzs_to_idx(0, 0, 0, 0);
        let left = lattice.offset(origin, &LatticePos::new(-1, 0, 0, 1));
        assert_eq!(lattice.idx_to_xyzs(left), (2, 0, 0, 1));
        let back = lattice.offset(left, &LatticePos::new(1, 0, 0, 0));
        assert_eq!(back, origin);
        let far = lattice.offset(origin, &LatticePos::new(7, -4, 3, 0));
        assert_eq!(lattice.idx_to_xyzs(far), (1, 2, 0, 0));
    }

    #[test]
    fn populate_places_dopants_and_compensating_vacancies() {
        let network = doped_network();
        let lattice = Lattice::new(4, 4, 4, 2).expect("lattice");
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let dopings = [Doping {
            dopant: 3,
            host: 2,
            count: 10,
            vacancies_per_dopant: 0.5,
        }];
        let occupation = lattice.populate(&network, &dopings, 2, &mut rng).expect("populate");
        let counts = species_counts(&occupation);
        assert_eq!(counts.get(&3), Some(&10));
        assert_eq!(counts.get(&2), Some(&54));
        assert_eq!(counts.get(&VACANCY), Some(&7));
        assert_eq!(counts.get(&1), Some(&57));
        lattice.check_occupation(&occupation, &network).expect("legal");
    }

    #[test]
    fn populate_is_deterministic_per_seed() {
        let network = doped_network();
        let lattice = Lattice::new(3, 3, 3, 2).expect("lattice");
        let a = lattice
            .populate(&network, &[], 4, &mut ChaCha8Rng::seed_from_u64(11))
            .expect("populate");
        let b = lattice
            .populate(&network, &[], 4, &mut ChaCha8Rng::seed_from_u64(11))
            .expect("populate");
        assert_eq!(a, b);
    }

    #[test]
    fn too_many_vacancies_is_recoverable() {
        let network = doped_network();
        let lattice = Lattice::new(2, 2, 2, 2).expect("lattice");
        let err = lattice
            .populate(&network, &[], 9, &mut ChaCha8Rng::seed_from_u64(1))
            .unwrap_err();
        assert!(!err.is_critical());
    }

    #[test]
    fn illegal_occupant_is_a_mismatch() {
        let network = doped_network();
        let lattice = Lattice::new(2, 2, 2, 2).expect("lattice");
        let mut occupation = lattice
            .populate(&network, &[], 1, &mut ChaCha8Rng::seed_from_u64(1))
            .expect("populate");
        occupation[1] = VACANCY;
        let err = lattice.check_occupation(&occupation, &network).unwrap_err();
        assert!(err.is_critical());
    }
}
