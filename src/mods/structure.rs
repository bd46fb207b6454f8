//! Crystal structure collaborators: species bookkeeping and the periodic
//! shell search the jump builder consumes.

use crate::mods::{
    constants::{MAX_SPECIES, VACANCY},
    error::{KmcError, KmcResult},
    geometry::{LatticePos, Vec3},
};

pub type SpeciesId = u8;

const MAX_SEARCH_RANGE: i32 = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct Species {
    pub id: SpeciesId,
    pub symbol: String,
    pub charge: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeciesTable {
    species: Vec<Option<Species>>,
}

impl Default for SpeciesTable {
    fn default() -> Self {
        let mut species = vec![None; MAX_SPECIES];
        species[VACANCY as usize] = Some(Species {
            id: VACANCY,
            symbol: "Vac".to_string(),
            charge: 0.0,
        });
        Self { species }
    }
}

impl SpeciesTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: SpeciesId, symbol: &str, charge: f64) -> KmcResult<()> {
        if id == VACANCY {
            return Err(KmcError::invalid("Species", "id 0 is reserved for vacancies"));
        }
        if id as usize >= MAX_SPECIES {
            return Err(KmcError::invalid(
                "Species",
                format!("id {} exceeds the limit of {}", id, MAX_SPECIES - 1),
            ));
        }
        if self.species[id as usize].is_some() {
            return Err(KmcError::invalid("Species", format!("id {} defined twice", id)));
        }
        if !charge.is_finite() {
            return Err(KmcError::invalid("Species", "charge must be finite"));
        }
        self.species[id as usize] = Some(Species {
            id,
            symbol: symbol.to_string(),
            charge,
        });
        Ok(())
    }

    pub fn get(&self, id: SpeciesId) -> Option<&Species> {
        self.species.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn contains(&self, id: SpeciesId) -> bool {
        self.get(id).is_some()
    }

    pub fn charge(&self, id: SpeciesId) -> f64 {
        self.get(id).map_or(0.0, |s| s.charge)
    }

    pub fn symbol(&self, id: SpeciesId) -> &str {
        self.get(id).map_or("?", |s| s.symbol.as_str())
    }
}

/// One atom of the unit cell: fractional position, host species and every
/// species that may occupy the site during a simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct CellAtom {
    pub frac: Vec3,
    pub species: SpeciesId,
    pub occupants: Vec<SpeciesId>,
}

/// The read-only structure interface consumed by the jump builder and the
/// classifier. Implementations must be deterministic for fixed inputs.
pub trait StructureService {
    fn stack_count(&self) -> usize;

    fn species_at(&self, stack: usize) -> SpeciesId;

    fn occupants_at(&self, stack: usize) -> &[SpeciesId];

    fn cell_vectors(&self) -> [Vec3; 3];

    fn to_cartesian(&self, pos: &LatticePos) -> Vec3;

    /// Absolute positions of the `shells` nearest distinct-distance shells
    /// around `center`, sorted by distance.
    fn shell_search(
        &self,
        center: Vec3,
        shells: usize,
        allowed: Option<&[SpeciesId]>,
        excluded: &[LatticePos],
    ) -> KmcResult<Vec<LatticePos>>;
}

#[derive(Debug, Clone)]
pub struct UnitCell {
    vectors: [Vec3; 3],
    atoms: Vec<CellAtom>,
    reciprocal: [Vec3; 3],
    min_width: f64,
    tolerance: f64,
}

impl UnitCell {
    pub fn new(vectors: [Vec3; 3], atoms: Vec<CellAtom>, tolerance: f64) -> KmcResult<Self> {
        if atoms.is_empty() {
            return Err(KmcError::invalid("Atom", "unit cell holds no atoms"));
        }
        for (i, atom) in atoms.iter().enumerate() {
            if !atom.occupants.contains(&atom.species) {
                return Err(KmcError::invalid(
                    "Atom",
                    format!("atom {} does not list its host species as occupant", i),
                ));
            }
            if atom.occupants.iter().any(|&o| o as usize >= MAX_SPECIES) {
                return Err(KmcError::invalid("Atom", format!("atom {} has an occupant id out of range", i)));
            }
        }

        let [a, b, c] = vectors;
        let volume = a.dot(&b.cross(&c));
        if volume.abs() <= tolerance {
            return Err(KmcError::invalid("Cell", "cell vectors are coplanar"));
        }

        let reciprocal = [
            b.cross(&c) * (1.0 / volume),
            c.cross(&a) * (1.0 / volume),
            a.cross(&b) * (1.0 / volume),
        ];
        let min_width = reciprocal
            .iter()
            .map(|r| 1.0 / r.length())
            .fold(f64::INFINITY, f64::min);

        Ok(Self {
            vectors,
            atoms,
            reciprocal,
            min_width,
            tolerance,
        })
    }

    /// Cell vectors from lengths and angles in degrees, `a` along x and `b` in the xy plane.
    pub fn vectors_from_parameters(
        a: f64,
        b: f64,
        c: f64,
        alpha: f64,
        beta: f64,
        gamma: f64,
    ) -> [Vec3; 3] {
        let (ca, cb, cg) = (
            alpha.to_radians().cos(),
            beta.to_radians().cos(),
            gamma.to_radians().cos(),
        );
        let sg = gamma.to_radians().sin();
        let cy = (ca - cb * cg) / sg;
        let cz = (1.0 - cb * cb - cy * cy).max(0.0).sqrt();
        [
            Vec3::new(a, 0.0, 0.0),
            Vec3::new(b * cg, b * sg, 0.0),
            Vec3::new(c * cb, c * cy, c * cz),
        ]
    }

    pub fn atoms(&self) -> &[CellAtom] {
        &self.atoms
    }

    pub fn volume(&self) -> f64 {
        let [a, b, c] = self.vectors;
        a.dot(&b.cross(&c)).abs()
    }

    fn fractional(&self, point: Vec3) -> Vec3 {
        Vec3::new(
            point.dot(&self.reciprocal[0]),
            point.dot(&self.reciprocal[1]),
            point.dot(&self.reciprocal[2]),
        )
    }
}

impl StructureService for UnitCell {
    fn stack_count(&self) -> usize {
        self.atoms.len()
    }

    fn species_at(&self, stack: usize) -> SpeciesId {
        self.atoms[stack].species
    }

    fn occupants_at(&self, stack: usize) -> &[SpeciesId] {
        &self.atoms[stack].occupants
    }

    fn cell_vectors(&self) -> [Vec3; 3] {
        self.vectors
    }

    fn to_cartesian(&self, pos: &LatticePos) -> Vec3 {
        let f = self.atoms[pos.s].frac;
        let [a, b, c] = self.vectors;
        a * (pos.x as f64 + f.x) + b * (pos.y as f64 + f.y) + c * (pos.z as f64 + f.z)
    }

    fn shell_search(
        &self,
        center: Vec3,
        shells: usize,
        allowed: Option<&[SpeciesId]>,
        excluded: &[LatticePos],
    ) -> KmcResult<Vec<LatticePos>> {
        if shells == 0 {
            return Ok(Vec::new());
        }

        let is_allowed = |stack: usize| allowed.is_none_or(|a| a.contains(&self.atoms[stack].species));
        if !(0..self.atoms.len()).any(is_allowed) {
            return Ok(Vec::new());
        }

        let frac = self.fractional(center);
        let (cx, cy, cz) = (
            frac.x.floor() as i32,
            frac.y.floor() as i32,
            frac.z.floor() as i32,
        );
        let tol = self.tolerance;

        for range in 1..=MAX_SEARCH_RANGE {
            let covered = range as f64 * self.min_width;
            let mut candidates: Vec<(f64, LatticePos)> = Vec::new();

            for ix in (cx - range)..=(cx + range) {
                for iy in (cy - range)..=(cy + range) {
                    for iz in (cz - range)..=(cz + range) {
                        for stack in 0..self.atoms.len() {
                            if !is_allowed(stack) {
                                continue;
                            }
                            let pos = LatticePos::new(ix, iy, iz, stack);
                            if excluded.contains(&pos) {
                                continue;
                            }
                            let dist = (self.to_cartesian(&pos) - center).length();
                            if dist <= covered + tol {
                                candidates.push((dist, pos));
                            }
                        }
                    }
                }
            }

            candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

            // Shell boundaries: indices where the distance jumps beyond tolerance.
            let mut shell_ends = Vec::new();
            for i in 1..candidates.len() {
                if candidates[i].0 - candidates[i - 1].0 > tol {
                    shell_ends.push(i);
                }
            }

            if shell_ends.len() >= shells {
                let end = shell_ends[shells - 1];
                if candidates[end - 1].0 + tol < covered {
                    return Ok(candidates.into_iter().take(end).map(|(_, p)| p).collect());
                }
            }
        }

        Err(KmcError::Structure(format!(
            "shell search around {} did not resolve {} shells within {} cells",
            center, shells, MAX_SEARCH_RANGE
        )))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Simple cubic cell, one mobile site (species 1, may be vacant).
    pub(crate) fn simple_cubic(a: f64) -> UnitCell {
        UnitCell::new(
            UnitCell::vectors_from_parameters(a, a, a, 90.0, 90.0, 90.0),
            vec![CellAtom {
                frac: Vec3::ZERO,
                species: 1,
                occupants: vec![1, VACANCY],
            }],
            1e-6,
        )
        .expect("valid cell")
    }

    #[test]
    fn cubic_first_shell_has_six_neighbors() {
        let cell = simple_cubic(2.0);
        let origin = LatticePos::origin(0);
        let found = cell
            .shell_search(cell.to_cartesian(&origin), 1, None, &[origin])
            .expect("search");
        assert_eq!(found.len(), 6);
        for p in &found {
            let d = (cell.to_cartesian(p) - Vec3::ZERO).length();
            assert!((d - 2.0).abs() < 1e-9);
        }
    }

    #[test]
    fn cubic_shell_counts_follow_distances() {
        let cell = simple_cubic(1.0);
        let origin = LatticePos::origin(0);
        let center = cell.to_cartesian(&origin);
        let two = cell.shell_search(center, 2, None, &[origin]).expect("search");
        assert_eq!(two.len(), 6 + 12);
        let three = cell.shell_search(center, 3, None, &[origin]).expect("search");
        assert_eq!(three.len(), 6 + 12 + 8);
    }

    #[test]
    fn species_filter_without_match_returns_empty() {
        let cell = simple_cubic(1.0);
        let found = cell
            .shell_search(Vec3::ZERO, 1, Some(&[7]), &[])
            .expect("search");
        assert!(found.is_empty());
    }

    #[test]
    fn midpoint_search_sees_both_ends() {
        let cell = simple_cubic(1.0);
        let found = cell
            .shell_search(Vec3::new(0.5, 0.0, 0.0), 1, None, &[])
            .expect("search");
        assert_eq!(found.len(), 2);
        assert!(found.contains(&LatticePos::new(0, 0, 0, 0)));
        assert!(found.contains(&LatticePos::new(1, 0, 0, 0)));
    }

    #[test]
    fn species_table_rejects_reserved_and_duplicate_ids() {
        let mut table = SpeciesTable::new();
        assert!(table.add(0, "X", 1.0).is_err());
        table.add(1, "Na", 1.0).expect("add");
        assert!(table.add(1, "K", 1.0).is_err());
        assert_eq!(table.symbol(1), "Na");
        assert_eq!(table.charge(VACANCY), 0.0);
    }

    #[test]
    fn triclinic_parameters_reproduce_lengths() {
        let v = UnitCell::vectors_from_parameters(3.0, 4.0, 5.0, 80.0, 95.0, 110.0);
        assert!((v[0].length() - 3.0).abs() < 1e-12);
        assert!((v[1].length() - 4.0).abs() < 1e-12);
        assert!((v[2].length() - 5.0).abs() < 1e-9);
        let cos_gamma = v[0].dot(&v[1]) / 12.0;
        assert!((cos_gamma - 110f64.to_radians().cos()).abs() < 1e-12);
    }
}
