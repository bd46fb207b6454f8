//! Groups raw jumps into unique jump classes, builds the interaction catalog
//! and exposes the energy configuration surface.

use crate::mods::{
    congruence::{Congruence, CylPoint, InteractionGeometry, JumpGeometry, Tolerance},
    error::{KmcError, KmcResult},
    geometry::{CylCoord, LatticePos},
    jumps::JumpCollection,
    structure::{SpeciesId, StructureService},
};
use log::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct EnvCoordinate {
    pub species: SpeciesId,
    pub occupants: Vec<SpeciesId>,
    pub cyl: CylCoord,
    pub ignored: bool,
    pub additive: bool,
    /// Energy in eV per entry of `occupants`.
    pub energies: Vec<f64>,
}

impl EnvCoordinate {
    fn occupant_slot(&self, species: SpeciesId) -> Option<usize> {
        self.occupants.iter().position(|&o| o == species)
    }

    pub fn is_coded(&self) -> bool {
        !self.ignored && !self.additive
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UniqueJump {
    pub id: usize,
    /// Canonical member, first jump discovered for this class.
    pub stack: usize,
    pub dest: LatticePos,
    pub length: f64,
    pub active: bool,
    pub activation_energy: f64,
    pub coords: Vec<EnvCoordinate>,
    /// Interaction id per partner, sorted.
    pub interactions: Vec<usize>,
    pub members: Vec<(usize, usize)>,
    coord_offset: usize,
    geometry: JumpGeometry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    pub id: usize,
    pub species: SpeciesId,
    pub occupants: Vec<SpeciesId>,
    pub start_distance: f64,
    pub dest_distance: f64,
    /// Energy in eV per entry of `occupants`.
    pub energies: Vec<f64>,
    geometry: InteractionGeometry,
}

impl Interaction {
    pub fn start_shell(&self) -> &[CylPoint] {
        &self.geometry.start_side.points
    }

    pub fn dest_shell(&self) -> &[CylPoint] {
        &self.geometry.dest_side.points
    }
}

#[derive(Debug, Clone)]
pub struct ClassifiedNetwork {
    jumps: JumpCollection,
    uniques: Vec<UniqueJump>,
    interactions: Vec<Interaction>,
    tol: Tolerance,
}

impl ClassifiedNetwork {
    pub fn classify<S: StructureService + ?Sized>(
        structure: &S,
        mut jumps: JumpCollection,
        tol: Tolerance,
    ) -> KmcResult<Self> {
        let mut uniques: Vec<UniqueJump> = Vec::new();

        for stack in 0..jumps.stack_count() {
            for index in 0..jumps.stack_jumps(stack).len() {
                let jump = &jumps.stack_jumps(stack)[index];
                let geometry =
                    JumpGeometry::new(structure, &jump.start(), &jump.dest, &jump.env, tol)?;

                let matched = uniques.iter().find_map(|u| match u.geometry.compare(&geometry, tol) {
                    Congruence::Equal(order) => Some((u.id, order)),
                    Congruence::Unequal => None,
                });

                let (unique, order) = match matched {
                    Some(hit) => hit,
                    None => {
                        let id = uniques.len();
                        uniques.push(new_unique(structure, id, stack, jump.dest, &jump.env, geometry));
                        (id, (0..jump.env.len()).collect())
                    }
                };

                jumps.assign_unique(stack, index, unique, &order)?;
                check_member_occupants(structure, &uniques[unique], &jumps.stack_jumps(stack)[index].env)?;
                uniques[unique].members.push((stack, index));
            }
        }

        let mut offset = 0;
        for u in uniques.iter_mut() {
            u.coord_offset = offset;
            offset += u.coords.len();
        }

        let interactions = classify_interactions(structure, &mut jumps, &mut uniques, tol)?;

        info!(
            "Classified {} jumps into {} unique jumps and {} interactions",
            jumps.len(),
            uniques.len(),
            interactions.len()
        );

        Ok(Self {
            jumps,
            uniques,
            interactions,
            tol,
        })
    }

    pub fn jumps(&self) -> &JumpCollection {
        &self.jumps
    }

    pub fn uniques(&self) -> &[UniqueJump] {
        &self.uniques
    }

    pub fn unique(&self, id: usize) -> KmcResult<&UniqueJump> {
        self.uniques
            .get(id)
            .ok_or(KmcError::UnknownId { kind: "unique jump", id })
    }

    pub fn interactions(&self) -> &[Interaction] {
        &self.interactions
    }

    pub fn tolerance(&self) -> Tolerance {
        self.tol
    }

    pub fn coordinate_count(&self) -> usize {
        self.uniques.iter().map(|u| u.coords.len()).sum()
    }

    pub fn coordinate_id(&self, unique: usize, local: usize) -> KmcResult<usize> {
        let u = self.unique(unique)?;
        if local >= u.coords.len() {
            return Err(KmcError::UnknownId {
                kind: "coordinate",
                id: local,
            });
        }
        Ok(u.coord_offset + local)
    }

    pub fn locate_coordinate(&self, raw: usize) -> KmcResult<(usize, usize)> {
        self.uniques
            .iter()
            .find(|u| raw >= u.coord_offset && raw < u.coord_offset + u.coords.len())
            .map(|u| (u.id, raw - u.coord_offset))
            .ok_or(KmcError::UnknownId {
                kind: "coordinate",
                id: raw,
            })
    }

    pub fn set_activation_energy(&mut self, unique: usize, energy: f64) -> KmcResult<()> {
        check_energy("ActivationEnergy", energy)?;
        self.unique(unique)?;
        self.uniques[unique].activation_energy = energy;
        Ok(())
    }

    pub fn set_coordinate_energy(&mut self, raw: usize, species: SpeciesId, energy: f64) -> KmcResult<()> {
        let (unique, local) = self.locate_coordinate(raw)?;
        self.set_unique_coordinate_energy(unique, local, species, energy)
    }

    pub fn set_unique_coordinate_energy(
        &mut self,
        unique: usize,
        local: usize,
        species: SpeciesId,
        energy: f64,
    ) -> KmcResult<()> {
        check_energy("CoordEnergy", energy)?;
        let coord = self.coordinate_mut(unique, local)?;
        let slot = coord.occupant_slot(species).ok_or_else(|| {
            KmcError::invalid(
                "CoordEnergy",
                format!("species {} cannot occupy coordinate {} of unique jump {}", species, local, unique),
            )
        })?;
        coord.energies[slot] = energy;
        Ok(())
    }

    pub fn set_interaction_energy(&mut self, id: usize, species: SpeciesId, energy: f64) -> KmcResult<()> {
        check_energy("InteractionEnergy", energy)?;
        let interaction = self
            .interactions
            .get_mut(id)
            .ok_or(KmcError::UnknownId { kind: "interaction", id })?;
        let slot = interaction.occupants.iter().position(|&o| o == species).ok_or_else(|| {
            KmcError::invalid(
                "InteractionEnergy",
                format!("species {} cannot occupy interaction {}", species, id),
            )
        })?;
        interaction.energies[slot] = energy;
        Ok(())
    }

    pub fn set_coordinate_ignored(&mut self, unique: usize, local: usize, ignored: bool) -> KmcResult<()> {
        self.coordinate_mut(unique, local)?.ignored = ignored;
        Ok(())
    }

    pub fn set_coordinate_additive(&mut self, unique: usize, local: usize, additive: bool) -> KmcResult<()> {
        self.coordinate_mut(unique, local)?.additive = additive;
        Ok(())
    }

    /// Toggles a class together with the classes of its members' backjumps.
    /// Leaves the network untouched when a mobile stack would end up without
    /// an active jump.
    pub fn set_unique_active(&mut self, unique: usize, active: bool) -> KmcResult<()> {
        self.unique(unique)?;
        let snapshot: Vec<bool> = self.uniques.iter().map(|u| u.active).collect();

        let mut touched = vec![unique];
        for &(stack, index) in &self.uniques[unique].members {
            if let Some(jump) = self.jumps.get(stack, index) {
                if let Some(back) = self.jumps.backjump_of(jump).unique {
                    touched.push(back);
                }
            }
        }
        for id in touched {
            self.uniques[id].active = active;
        }

        if let Some(stack) = self.first_stack_without_active_jump() {
            for (u, was) in self.uniques.iter_mut().zip(snapshot) {
                u.active = was;
            }
            return Err(KmcError::Deactivation { unique, stack });
        }
        debug!("unique jump {} active: {}", unique, active);
        Ok(())
    }

    fn first_stack_without_active_jump(&self) -> Option<usize> {
        (0..self.jumps.stack_count()).find(|&s| {
            let list = self.jumps.stack_jumps(s);
            !list.is_empty()
                && !list
                    .iter()
                    .any(|j| j.unique.is_some_and(|u| self.uniques[u].active))
        })
    }

    fn coordinate_mut(&mut self, unique: usize, local: usize) -> KmcResult<&mut EnvCoordinate> {
        self.unique(unique)?;
        self.uniques[unique]
            .coords
            .get_mut(local)
            .ok_or(KmcError::UnknownId {
                kind: "coordinate",
                id: local,
            })
    }
}

fn check_energy(key: &str, energy: f64) -> KmcResult<()> {
    if energy.is_finite() {
        Ok(())
    } else {
        Err(KmcError::invalid(key, "energy must be finite"))
    }
}

/// A member's environment, in canonical order, must admit exactly the
/// occupants of its class coordinates so one code table serves every member.
fn check_member_occupants<S: StructureService + ?Sized>(
    structure: &S,
    class: &UniqueJump,
    env: &[LatticePos],
) -> KmcResult<()> {
    for (local, (pos, coord)) in env.iter().zip(&class.coords).enumerate() {
        if structure.occupants_at(pos.s) != coord.occupants.as_slice() {
            return Err(KmcError::InvariantViolation(format!(
                "coordinate {} of unique jump {} admits {:?}, member site admits {:?}",
                local,
                class.id,
                coord.occupants,
                structure.occupants_at(pos.s)
            )));
        }
    }
    Ok(())
}

fn new_unique<S: StructureService + ?Sized>(
    structure: &S,
    id: usize,
    stack: usize,
    dest: LatticePos,
    env: &[LatticePos],
    geometry: JumpGeometry,
) -> UniqueJump {
    let coords = env
        .iter()
        .zip(&geometry.start_side.points)
        .map(|(pos, point)| {
            let occupants = structure.occupants_at(pos.s).to_vec();
            EnvCoordinate {
                species: structure.species_at(pos.s),
                ignored: occupants.len() < 2,
                additive: false,
                energies: vec![0.0; occupants.len()],
                occupants,
                cyl: point.coord,
            }
        })
        .collect();

    UniqueJump {
        id,
        stack,
        dest,
        length: geometry.length,
        active: true,
        activation_energy: 0.0,
        coords,
        interactions: Vec::new(),
        members: Vec::new(),
        coord_offset: 0,
        geometry,
    }
}

fn classify_interactions<S: StructureService + ?Sized>(
    structure: &S,
    jumps: &mut JumpCollection,
    uniques: &mut [UniqueJump],
    tol: Tolerance,
) -> KmcResult<Vec<Interaction>> {
    let mut catalog: Vec<Interaction> = Vec::new();

    for stack in 0..jumps.stack_count() {
        for index in 0..jumps.stack_jumps(stack).len() {
            let jump = &jumps.stack_jumps(stack)[index];
            let (start, dest) = (jump.start(), jump.dest);

            let mut ids = Vec::with_capacity(jump.partners.len());
            for partner in &jump.partners {
                let geometry =
                    InteractionGeometry::new(structure, &start, &dest, &partner.pos, &partner.shell, tol)?;
                let found = catalog
                    .iter()
                    .position(|i| i.geometry.compare(&geometry, tol).is_equal());
                let id = match found {
                    Some(id) => id,
                    None => {
                        let occupants = structure.occupants_at(partner.pos.s).to_vec();
                        catalog.push(Interaction {
                            id: catalog.len(),
                            species: geometry.species,
                            start_distance: geometry.start_distance,
                            dest_distance: geometry.dest_distance,
                            energies: vec![0.0; occupants.len()],
                            occupants,
                            geometry,
                        });
                        catalog.len() - 1
                    }
                };
                ids.push(id);
            }

            let partners = jumps.partners_mut(stack, index);
            for (partner, id) in partners.iter_mut().zip(&ids) {
                partner.interaction = Some(*id);
            }
            partners.sort_by_key(|p| p.interaction);
            ids.sort_unstable();

            let unique = jumps.stack_jumps(stack)[index].unique.ok_or_else(|| {
                KmcError::InvariantViolation(format!("jump {} of stack {} has no class", index, stack))
            })?;
            let class = &mut uniques[unique];
            if class.stack == stack && class.members.first() == Some(&(stack, index)) {
                class.interactions = ids;
            } else if class.interactions != ids {
                return Err(KmcError::InvariantViolation(format!(
                    "jump {} of stack {} couples to interactions {:?}, its class {} to {:?}",
                    index, stack, ids, unique, class.interactions
                )));
            }
        }
    }
    Ok(catalog)
}
