//! Flattens the active part of a classified network into the arena the
//! simulation loop reads: integer-linked jumps, Boltzmann tables and field
//! factors.

use crate::mods::{
    classifier::ClassifiedNetwork,
    constants::{K_BOLTZMANN_EV, MAX_SPECIES},
    encoder::EnvironmentEncoder,
    error::{KmcError, KmcResult},
    geometry::{LatticePos, Vec3},
    structure::{SpeciesId, SpeciesTable, StructureService},
};
use log::{debug, info};

const UNLINKED: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompileParams {
    pub temperature: f64,
    pub attempt_frequency: f64,
    pub field_direction: Vec3,
    /// V/Angstrom
    pub field_magnitude: f64,
}

impl CompileParams {
    fn validate(&self) -> KmcResult<()> {
        if !(self.temperature > 0.0) {
            return Err(KmcError::invalid("T", "must be > 0"));
        }
        if !(self.attempt_frequency > 0.0) {
            return Err(KmcError::invalid("AttemptFrequency", "must be > 0"));
        }
        if !self.field_magnitude.is_finite() || self.field_magnitude < 0.0 {
            return Err(KmcError::invalid("FieldMagnitude", "must be finite and >= 0"));
        }
        if self.field_magnitude > 0.0 && self.field_direction.normalized(1e-12).is_none() {
            return Err(KmcError::invalid("FieldX/FieldY/FieldZ", "field direction is zero"));
        }
        Ok(())
    }

    pub fn field_unit(&self) -> Vec3 {
        self.field_direction.normalized(1e-12).unwrap_or(Vec3::ZERO)
    }
}

/// One active jump direction of a site. The vacancy moves from the site to
/// `dest`; the mobile atom moves the other way.
#[derive(Debug, Clone, PartialEq)]
pub struct SimJump {
    pub stack: usize,
    pub direction: usize,
    pub source: usize,
    pub dest: LatticePos,
    pub backjump: usize,
    pub unique: usize,
    pub field_factor: f64,
    /// Cartesian displacement of the mobile atom.
    pub displacement: Vec3,
    pub code_env: Box<[LatticePos]>,
    pub additive_env: Box<[LatticePos]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimUniqueJump {
    pub source: usize,
    pub encoder: EnvironmentEncoder,
    /// `exp(-E / kT)` per environment code.
    pub boltzmann: Box<[f64]>,
    /// Flattened `[additive coordinate][species] -> exp(-e / kT)`.
    pub additive_factors: Box<[f64]>,
    pub max_factor: f64,
}

impl SimUniqueJump {
    #[inline(always)]
    pub fn additive_factor(&self, coordinate: usize, species: SpeciesId) -> f64 {
        self.additive_factors[coordinate * MAX_SPECIES + species as usize]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledNetwork {
    pub jumps: Box<[SimJump]>,
    pub uniques: Box<[SimUniqueJump]>,
    site_offsets: Box<[usize]>,
    pub mobile: SpeciesId,
    pub charge: f64,
    pub kt: f64,
    pub attempt_frequency: f64,
    pub field_unit: Vec3,
    pub field_magnitude: f64,
    /// Analytic upper bound of `boltzmann * additive * field` over all jumps.
    pub normalization: f64,
    pub stack_species: Box<[SpeciesId]>,
    pub stack_occupants: Vec<Vec<SpeciesId>>,
    pub cell_vectors: [Vec3; 3],
}

impl CompiledNetwork {
    pub fn compile<S: StructureService + ?Sized>(
        network: &ClassifiedNetwork,
        structure: &S,
        species: &SpeciesTable,
        params: CompileParams,
    ) -> KmcResult<Self> {
        params.validate()?;
        let kt = K_BOLTZMANN_EV * params.temperature;
        let jumps_in = network.jumps();
        let mobile = jumps_in.mobile();
        let charge = species.charge(mobile);
        let field_unit = params.field_unit();
        let field = field_unit * params.field_magnitude;

        // Active unique jumps, renumbered contiguously.
        let mut sim_index = vec![None; network.uniques().len()];
        let mut uniques = Vec::new();
        for u in network.uniques().iter().filter(|u| u.active) {
            sim_index[u.id] = Some(uniques.len());

            let coded: Vec<Vec<SpeciesId>> = u
                .coords
                .iter()
                .filter(|c| c.is_coded())
                .map(|c| c.occupants.clone())
                .collect();
            let encoder = EnvironmentEncoder::new(u.id, &coded)?;
            let coded_coords: Vec<_> = u.coords.iter().filter(|c| c.is_coded()).collect();

            let mut boltzmann = Vec::with_capacity(encoder.table_size());
            for code in 0..encoder.table_size() {
                let occupation = encoder.decode(code).ok_or_else(|| {
                    KmcError::InvariantViolation(format!("code {} of unique jump {} does not decode", code, u.id))
                })?;
                let mut energy = u.activation_energy;
                for (coord, s) in coded_coords.iter().zip(&occupation) {
                    if let Some(slot) = coord.occupants.iter().position(|o| o == s) {
                        energy += coord.energies[slot];
                    }
                }
                boltzmann.push((-energy / kt).exp());
            }

            let mut rows: Vec<(&[SpeciesId], &[f64])> = u
                .coords
                .iter()
                .filter(|c| c.additive && !c.ignored)
                .map(|c| (c.occupants.as_slice(), c.energies.as_slice()))
                .collect();
            for &id in &u.interactions {
                let i = &network.interactions()[id];
                rows.push((i.occupants.as_slice(), i.energies.as_slice()));
            }

            let mut additive_factors = vec![1.0; rows.len() * MAX_SPECIES];
            let mut max_factor = boltzmann.iter().copied().fold(0.0, f64::max);
            for (k, (occupants, energies)) in rows.iter().enumerate() {
                let mut row_max: f64 = 0.0;
                for (&s, &e) in occupants.iter().zip(energies.iter()) {
                    let f = (-e / kt).exp();
                    additive_factors[k * MAX_SPECIES + s as usize] = f;
                    row_max = row_max.max(f);
                }
                max_factor *= row_max;
            }

            debug!(
                "unique jump {} -> sim {}: {} coded, {} additive, table {}",
                u.id,
                uniques.len(),
                encoder.len(),
                rows.len(),
                encoder.table_size()
            );
            uniques.push(SimUniqueJump {
                source: u.id,
                encoder,
                boltzmann: boltzmann.into_boxed_slice(),
                additive_factors: additive_factors.into_boxed_slice(),
                max_factor,
            });
        }

        // Pass 1: allocate every active jump slot.
        let stacks = jumps_in.stack_count();
        let mut slot: Vec<Vec<usize>> = vec![Vec::new(); stacks];
        let mut site_offsets = Vec::with_capacity(stacks + 1);
        let mut jumps: Vec<SimJump> = Vec::new();

        for stack in 0..stacks {
            site_offsets.push(jumps.len());
            let mut direction = 0;
            for jump in jumps_in.stack_jumps(stack) {
                let unique = jump
                    .unique
                    .ok_or_else(|| KmcError::InvariantViolation(format!("jump {} of stack {} unclassified", jump.index, stack)))?;
                let Some(sim_unique) = sim_index[unique] else {
                    slot[stack].push(UNLINKED);
                    continue;
                };
                let class = &network.uniques()[unique];

                let code_env: Vec<LatticePos> = class
                    .coords
                    .iter()
                    .zip(&jump.env)
                    .filter(|(c, _)| c.is_coded())
                    .map(|(_, &p)| p)
                    .collect();
                let mut additive_env: Vec<LatticePos> = class
                    .coords
                    .iter()
                    .zip(&jump.env)
                    .filter(|(c, _)| c.additive && !c.ignored)
                    .map(|(_, &p)| p)
                    .collect();
                additive_env.extend(jump.partners.iter().map(|p| p.pos));

                let start = structure.to_cartesian(&jump.start());
                let dest = structure.to_cartesian(&jump.dest);
                let displacement = start - dest;
                let field_energy = charge * field.dot(&(displacement * 0.5)) / kt;

                slot[stack].push(jumps.len());
                jumps.push(SimJump {
                    stack,
                    direction,
                    source: jump.index,
                    dest: jump.dest,
                    backjump: UNLINKED,
                    unique: sim_unique,
                    field_factor: field_energy.exp(),
                    displacement,
                    code_env: code_env.into_boxed_slice(),
                    additive_env: additive_env.into_boxed_slice(),
                });
                direction += 1;
            }
            if direction == 0 && !jumps_in.stack_jumps(stack).is_empty() {
                return Err(KmcError::InvariantViolation(format!(
                    "mobile stack {} has no active jump",
                    stack
                )));
            }
        }
        site_offsets.push(jumps.len());

        // Pass 2: link backjumps, which may live on stacks built later.
        for sim in jumps.iter_mut() {
            let jump = &jumps_in.stack_jumps(sim.stack)[sim.source];
            let back = slot[jump.dest.s]
                .get(jump.backjump)
                .copied()
                .filter(|&b| b != UNLINKED)
                .ok_or(KmcError::MissingBackjump {
                    stack: sim.stack,
                    jump: sim.source,
                })?;
            sim.backjump = back;
        }

        let normalization = jumps
            .iter()
            .map(|j| uniques[j.unique].max_factor * j.field_factor)
            .fold(0.0, f64::max);
        if !(normalization > 0.0) || !normalization.is_finite() {
            return Err(KmcError::invalid(
                "ActivationEnergy",
                format!("analytic normalization {} is not a positive finite number", normalization),
            ));
        }

        let stack_species: Vec<SpeciesId> = (0..stacks).map(|s| structure.species_at(s)).collect();
        let stack_occupants = (0..stacks).map(|s| structure.occupants_at(s).to_vec()).collect();

        info!(
            "Compiled {} sim jumps from {} active unique jumps (normalization {:.5e})",
            jumps.len(),
            uniques.len(),
            normalization
        );

        Ok(Self {
            jumps: jumps.into_boxed_slice(),
            uniques: uniques.into_boxed_slice(),
            site_offsets: site_offsets.into_boxed_slice(),
            mobile,
            charge,
            kt,
            attempt_frequency: params.attempt_frequency,
            field_unit,
            field_magnitude: params.field_magnitude,
            normalization,
            stack_species: stack_species.into_boxed_slice(),
            stack_occupants,
            cell_vectors: structure.cell_vectors(),
        })
    }

    pub fn stack_count(&self) -> usize {
        self.stack_species.len()
    }

    #[inline(always)]
    pub fn site_jumps(&self, stack: usize) -> &[SimJump] {
        &self.jumps[self.site_offsets[stack]..self.site_offsets[stack + 1]]
    }

    #[inline(always)]
    pub fn direction_count(&self, stack: usize) -> usize {
        self.site_offsets[stack + 1] - self.site_offsets[stack]
    }

    #[inline(always)]
    pub fn jump_index(&self, stack: usize, direction: usize) -> usize {
        self.site_offsets[stack] + direction
    }

    /// `boltzmann * additive * field` of `jump` with the environment read
    /// through `occupant`, which resolves positions relative to the jump start.
    #[inline(always)]
    pub fn jump_factor<F: Fn(&LatticePos) -> SpeciesId>(&self, jump: &SimJump, occupant: F) -> f64 {
        let unique = &self.uniques[jump.unique];
        let code = unique.encoder.encode_with(|k| occupant(&jump.code_env[k]));
        let mut factor = unique.boltzmann[code] * jump.field_factor;
        for (k, pos) in jump.additive_env.iter().enumerate() {
            factor *= unique.additive_factor(k, occupant(pos));
        }
        factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mods::{
        congruence::Tolerance,
        constants::VACANCY,
        jumps::{JumpCollection, ShellConfig},
        structure::{CellAtom, UnitCell, tests::simple_cubic},
    };

    fn species() -> SpeciesTable {
        let mut t = SpeciesTable::new();
        t.add(1, "Na", 1.0).expect("species");
        t
    }

    fn params() -> CompileParams {
        CompileParams {
            temperature: 600.0,
            attempt_frequency: 1.0e13,
            field_direction: Vec3::new(1.0, 0.0, 0.0),
            field_magnitude: 0.0,
        }
    }

    fn cubic_network(shells: ShellConfig) -> (UnitCell, ClassifiedNetwork) {
        let cell = simple_cubic(1.0);
        let jumps = JumpCollection::build(&cell, 1, shells).expect("build");
        let network = ClassifiedNetwork::classify(&cell, jumps, Tolerance::default()).expect("classify");
        (cell, network)
    }

    #[test]
    fn backjump_pointers_are_involutive() {
        let (cell, network) = cubic_network(ShellConfig::default());
        let compiled = CompiledNetwork::compile(&network, &cell, &species(), params()).expect("compile");
        assert_eq!(compiled.direction_count(0), 6);
        for (i, jump) in compiled.jumps.iter().enumerate() {
            assert_eq!(compiled.jumps[jump.backjump].backjump, i);
            let back = &compiled.jumps[jump.backjump];
            assert_eq!(back.dest, jump.dest.reversed(jump.stack));
        }
    }

    #[test]
    fn activation_energy_sets_the_table_and_normalization() {
        let (cell, mut network) = cubic_network(ShellConfig::default());
        network.set_activation_energy(0, 0.3).expect("energy");
        let p = params();
        let compiled = CompiledNetwork::compile(&network, &cell, &species(), p).expect("compile");
        let expected = (-0.3 / (K_BOLTZMANN_EV * p.temperature)).exp();
        let table = &compiled.uniques[0].boltzmann;
        assert!(table.iter().all(|&b| (b - expected).abs() < 1e-15));
        assert!((compiled.normalization - expected).abs() < 1e-15);
    }

    #[test]
    fn coded_energies_enter_the_table() {
        let (cell, mut network) = cubic_network(ShellConfig::default());
        network
            .set_unique_coordinate_energy(0, 0, VACANCY, 0.1)
            .expect("energy");
        let compiled = CompiledNetwork::compile(&network, &cell, &species(), params()).expect("compile");
        let u = &compiled.uniques[0];
        let kt = compiled.kt;
        let code_table = &u.boltzmann;
        let mut occupation = vec![1; u.encoder.len()];
        let full = u.encoder.encode(&occupation).expect("encode");
        assert!((code_table[full] - 1.0).abs() < 1e-15);
        occupation[0] = VACANCY;
        let vac = u.encoder.encode(&occupation).expect("encode");
        assert!((code_table[vac] - (-0.1 / kt).exp()).abs() < 1e-15);
    }

    #[test]
    fn field_factors_pair_up_across_backjumps() {
        let (cell, network) = cubic_network(ShellConfig::default());
        let mut p = params();
        p.field_magnitude = 0.01;
        let compiled = CompiledNetwork::compile(&network, &cell, &species(), p).expect("compile");
        for jump in compiled.jumps.iter() {
            let back = &compiled.jumps[jump.backjump];
            assert!((jump.field_factor * back.field_factor - 1.0).abs() < 1e-12);
        }
        let along = compiled
            .jumps
            .iter()
            .find(|j| j.displacement.x > 0.5)
            .expect("jump along field");
        assert!(along.field_factor > 1.0);
        assert!((compiled.normalization - along.field_factor).abs() < 1e-12);
    }

    #[test]
    fn additive_coordinates_move_out_of_the_table() {
        let (cell, mut network) = cubic_network(ShellConfig::default());
        let coded_before = network.uniques()[0].coords.iter().filter(|c| c.is_coded()).count();
        network.set_coordinate_additive(0, 0, true).expect("additive");
        network.set_unique_coordinate_energy(0, 0, VACANCY, -0.2).expect("energy");
        let compiled = CompiledNetwork::compile(&network, &cell, &species(), params()).expect("compile");
        let u = &compiled.uniques[0];
        assert_eq!(u.encoder.len(), coded_before - 1);
        assert_eq!(compiled.jumps[0].additive_env.len(), 1);
        let kt = compiled.kt;
        assert!((u.additive_factor(0, VACANCY) - (0.2 / kt).exp()).abs() < 1e-9);
        assert!((u.max_factor - (0.2 / kt).exp()).abs() < 1e-9);
    }

    #[test]
    fn inactive_classes_are_dropped_and_renumbered() {
        let cell = UnitCell::new(
            UnitCell::vectors_from_parameters(1.0, 1.0, 1.2, 90.0, 90.0, 90.0),
            vec![CellAtom {
                frac: Vec3::ZERO,
                species: 1,
                occupants: vec![1, VACANCY],
            }],
            1e-6,
        )
        .expect("cell");
        let shells = ShellConfig {
            jump: 2,
            ..ShellConfig::default()
        };
        let jumps = JumpCollection::build(&cell, 1, shells).expect("build");
        let mut network = ClassifiedNetwork::classify(&cell, jumps, Tolerance::default()).expect("classify");
        network.set_unique_active(0, false).expect("deactivate");
        let compiled = CompiledNetwork::compile(&network, &cell, &species(), params()).expect("compile");
        assert_eq!(compiled.uniques.len(), 1);
        assert_eq!(compiled.uniques[0].source, 1);
        assert_eq!(compiled.direction_count(0), 2);
        assert!(compiled.jumps.iter().all(|j| j.unique == 0));
    }

    #[test]
    fn invalid_parameters_are_recoverable() {
        let (cell, network) = cubic_network(ShellConfig::default());
        let mut p = params();
        p.temperature = 0.0;
        let err = CompiledNetwork::compile(&network, &cell, &species(), p).unwrap_err();
        assert!(!err.is_critical());
    }
}
