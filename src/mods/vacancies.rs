use crate::mods::{compiler::CompiledNetwork, constants::VACANCY, structure::SpeciesId};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

const NO_CLASS: u8 = u8::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VacancyClass {
    pub dirs: usize,
    pub sites: Vec<usize>,
}

/// Vacancies grouped by the number of jump directions of their site, with
/// swap-remove lists so that insertion, removal and selection are O(1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VacancyPool {
    pub classes: Vec<VacancyClass>,
    stack_to_class: Box<[u8]>,
    idxg_to_class: Box<[u8]>,
    idxg_to_idxl: Box<[usize]>,
    paths: usize,
}

impl VacancyPool {
    pub fn new(network: &CompiledNetwork, total_grid_size: usize) -> Self {
        let mut classes: Vec<VacancyClass> = Vec::new();
        let mut stack_to_class = vec![NO_CLASS; network.stack_count()].into_boxed_slice();
        for stack in 0..network.stack_count() {
            let dirs = network.direction_count(stack);
            if dirs == 0 {
                continue;
            }
            let class = match classes.iter().position(|c| c.dirs == dirs) {
                Some(c) => c,
                None => {
                    classes.push(VacancyClass {
                        dirs,
                        sites: Vec::new(),
                    });
                    classes.len() - 1
                }
            };
            stack_to_class[stack] = class as u8;
        }

        Self {
            classes,
            stack_to_class,
            idxg_to_class: vec![NO_CLASS; total_grid_size].into_boxed_slice(),
            idxg_to_idxl: vec![0; total_grid_size].into_boxed_slice(),
            paths: 0,
        }
    }

    /// Clears the pool and refills it in site order.
    pub fn rebuild(&mut self, occupation: &[SpeciesId], stacks: usize) {
        for class in self.classes.iter_mut() {
            class.sites.clear();
        }
        self.idxg_to_class.fill(NO_CLASS);
        self.paths = 0;
        for (idxg, &s) in occupation.iter().enumerate() {
            if s == VACANCY {
                self.add(idxg, idxg % stacks);
            }
        }
    }

    #[inline(always)]
    pub fn add(&mut self, idxg: usize, stack: usize) {
        let class = self.stack_to_class[stack];
        if class == NO_CLASS || self.idxg_to_class[idxg] != NO_CLASS {
            return;
        }
        let list = &mut self.classes[class as usize];
        self.idxg_to_idxl[idxg] = list.sites.len();
        list.sites.push(idxg);
        self.idxg_to_class[idxg] = class;
        self.paths += list.dirs;
    }

    #[inline(always)]
    pub fn remove(&mut self, idxg: usize) {
        let class = self.idxg_to_class[idxg];
        if class == NO_CLASS {
            return;
        }
        self.idxg_to_class[idxg] = NO_CLASS;
        let idxl = self.idxg_to_idxl[idxg];
        let list = &mut self.classes[class as usize];
        self.paths -= list.dirs;

        if let Some(last_idxg) = list.sites.pop() {
            if idxl != list.sites.len() {
                list.sites[idxl] = last_idxg;
                self.idxg_to_idxl[last_idxg] = idxl;
            }
        }
        self.idxg_to_idxl[idxg] = 0;
    }

    /// A vacancy moved from `from` to `to`. Keeps its list slot when both
    /// sites share a class.
    #[inline(always)]
    pub fn relocate(&mut self, from: usize, to: usize, to_stack: usize) {
        let class = self.idxg_to_class[from];
        if class != NO_CLASS && class == self.stack_to_class[to_stack] {
            let idxl = self.idxg_to_idxl[from];
            self.classes[class as usize].sites[idxl] = to;
            self.idxg_to_class[from] = NO_CLASS;
            self.idxg_to_class[to] = class;
            self.idxg_to_idxl[to] = idxl;
            self.idxg_to_idxl[from] = 0;
        } else {
            self.remove(from);
            self.add(to, to_stack);
        }
    }

    pub fn contains(&self, idxg: usize) -> bool {
        self.idxg_to_class[idxg] != NO_CLASS
    }

    pub fn len(&self) -> usize {
        self.classes.iter().map(|c| c.sites.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.paths == 0
    }

    /// Total number of (vacancy, direction) pairs.
    #[inline(always)]
    pub fn paths(&self) -> usize {
        self.paths
    }

    /// Class chosen with weight `len * dirs`, vacancy uniform within it,
    /// direction uniform. Returns `(site, direction)`. The pool must not be
    /// empty.
    #[inline(always)]
    pub fn select(&self, rng: &mut ChaCha8Rng) -> (usize, usize) {
        let mut r = rng.random_range(0..self.paths);
        for class in &self.classes {
            let weight = class.sites.len() * class.dirs;
            if r < weight {
                return (class.sites[r / class.dirs], r % class.dirs);
            }
            r -= weight;
        }
        unreachable!("path count out of sync with vacancy classes")
    }
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
        structure::{SpeciesTable, tests::simple_cubic},
    };
    use rand::SeedableRng;

    fn cubic() -> CompiledNetwork {
        let cell = simple_cubic(1.0);
        let mut species = SpeciesTable::new();
        species.add(1, "Na", 1.0).expect("species");
        let jumps = JumpCollection::build(&cell, 1, ShellConfig::default()).expect("build");
        let network = ClassifiedNetwork::classify(&cell, jumps, Tolerance::default()).expect("classify");
        let params = CompileParams {
            temperature: 500.0,
            attempt_frequency: 1.0e13,
            field_direction: Vec3::new(1.0, 0.0, 0.0),
            field_magnitude: 0.0,
        };
        CompiledNetwork::compile(&network, &cell, &species, params).expect("compile")
    }

    #[test]
    fn add_remove_keep_lists_consistent() {
        let network = cubic();
        let mut pool = VacancyPool::new(&network, 27);
        for idx in [3, 8, 20, 5] {
            pool.add(idx, 0);
        }
        pool.add(8, 0);
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.paths(), 24);

        pool.remove(3);
        pool.remove(3);
        assert_eq!(pool.len(), 3);
        assert!(!pool.contains(3));
        for (l, &idx) in pool.classes[0].sites.iter().enumerate() {
            assert!(pool.contains(idx));
            assert_eq!(pool.idxg_to_idxl[idx], l);
        }
    }

    #[test]
    fn relocate_keeps_slot() {
        let network = cubic();
        let mut pool = VacancyPool::new(&network, 27);
        pool.add(1, 0);
        pool.add(2, 0);
        pool.relocate(1, 10, 0);
        assert_eq!(pool.classes[0].sites, vec![10, 2]);
        assert!(!pool.contains(1));
        assert!(pool.contains(10));
    }

    #[test]
    fn rebuild_follows_site_order() {
        let network = cubic();
        let mut pool = VacancyPool::new(&network, 8);
        let occupation = [1, VACANCY, 1, 1, VACANCY, 1, 1, VACANCY];
        pool.rebuild(&occupation, 1);
        assert_eq!(pool.classes[0].sites, vec![1, 4, 7]);
        assert_eq!(pool.paths(), 18);
    }

    #[test]
    fn selection_covers_all_pairs() {
        let network = cubic();
        let mut pool = VacancyPool::new(&network, 8);
        pool.add(2, 0);
        pool.add(6, 0);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut seen = [[false; 6]; 2];
        for _ in 0..2000 {
            let (site, dir) = pool.select(&mut rng);
            assert!(dir < 6);
            seen[usize::from(site == 6)][dir] = true;
        }
        assert!(seen.iter().flatten().all(|&s| s));
    }
}
