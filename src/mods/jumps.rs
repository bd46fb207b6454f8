//! Raw jump discovery: destinations, three-sphere environments, interaction
//! partners and backjump pairing.

use crate::mods::{
    error::{KmcError, KmcResult},
    geometry::LatticePos,
    structure::{SpeciesId, StructureService},
};
use log::{debug, info};
use std::collections::VecDeque;

const UNPAIRED: usize = usize::MAX;

/// Shell counts steering jump and environment discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellConfig {
    pub jump: usize,
    pub start: usize,
    pub mid: usize,
    pub dest: usize,
    pub interaction: usize,
    pub interaction_env: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            jump: 1,
            start: 1,
            mid: 1,
            dest: 1,
            interaction: 0,
            interaction_env: 1,
        }
    }
}

/// A site beyond the jump environment whose occupation couples to the jump.
#[derive(Debug, Clone, PartialEq)]
pub struct Partner {
    pub pos: LatticePos,
    pub shell: Vec<LatticePos>,
    pub interaction: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Jump {
    pub stack: usize,
    pub index: usize,
    /// Destination relative to the start, which always sits at the cell origin.
    pub dest: LatticePos,
    /// Direction id of the inverse jump inside the destination stack.
    pub backjump: usize,
    pub env: Vec<LatticePos>,
    pub partners: Vec<Partner>,
    pub unique: Option<usize>,
}

impl Jump {
    pub fn start(&self) -> LatticePos {
        LatticePos::origin(self.stack)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JumpCollection {
    mobile: SpeciesId,
    shells: ShellConfig,
    jumps: Vec<Vec<Jump>>,
}

impl JumpCollection {
    pub fn build<S: StructureService + ?Sized>(
        structure: &S,
        mobile: SpeciesId,
        shells: ShellConfig,
    ) -> KmcResult<Self> {
        if shells.jump == 0 {
            return Err(KmcError::invalid("JumpShells", "must be > 0"));
        }

        let stacks = structure.stack_count();
        let mobile_stacks: Vec<usize> = (0..stacks)
            .filter(|&s| structure.species_at(s) == mobile)
            .collect();
        if mobile_stacks.is_empty() {
            return Err(KmcError::Structure(format!(
                "no site of mobile species {} in the unit cell",
                mobile
            )));
        }

        let mut jumps: Vec<Vec<Jump>> = vec![Vec::new(); stacks];
        for &stack in &mobile_stacks {
            let start = LatticePos::origin(stack);
            let dests = structure.shell_search(
                structure.to_cartesian(&start),
                shells.jump,
                Some(&[mobile]),
                &[start],
            )?;
            if dests.is_empty() {
                return Err(KmcError::Structure(format!(
                    "stack {} has no jump destination within {} shells",
                    stack, shells.jump
                )));
            }

            for dest in dests {
                let jump = discover(structure, stack, jumps[stack].len(), dest, &shells)?;
                jumps[stack].push(jump);
            }
            debug!("stack {}: {} jump directions", stack, jumps[stack].len());
        }

        let mut collection = Self {
            mobile,
            shells,
            jumps,
        };
        collection.pair_backjumps(structure)?;

        info!(
            "Jump network built: {} jumps over {} mobile stacks",
            collection.len(),
            mobile_stacks.len()
        );
        Ok(collection)
    }

    fn pair_backjumps<S: StructureService + ?Sized>(&mut self, structure: &S) -> KmcResult<()> {
        let mut queue: VecDeque<(usize, usize)> = self
            .jumps
            .iter()
            .enumerate()
            .flat_map(|(s, list)| (0..list.len()).map(move |i| (s, i)))
            .collect();

        while let Some((stack, index)) = queue.pop_front() {
            if self.jumps[stack][index].backjump != UNPAIRED {
                continue;
            }
            let dest = self.jumps[stack][index].dest;
            let target = dest.s;
            let wanted = dest.reversed(stack);

            let found = self.jumps[target].iter().position(|j| j.dest == wanted);
            let back = match found {
                Some(k) => k,
                None => {
                    let k = self.jumps[target].len();
                    let synthesized = discover(structure, target, k, wanted, &self.shells)?;
                    debug!(
                        "synthesized backjump {} -> {} on stack {}",
                        LatticePos::origin(target),
                        wanted,
                        target
                    );
                    self.jumps[target].push(synthesized);
                    queue.push_back((target, k));
                    k
                }
            };

            self.jumps[stack][index].backjump = back;
            if self.jumps[target][back].backjump == UNPAIRED {
                self.jumps[target][back].backjump = index;
            }
        }

        for list in &self.jumps {
            for jump in list {
                let back = self.backjump_of(jump);
                if back.dest != jump.dest.reversed(jump.stack) || back.backjump != jump.index {
                    return Err(KmcError::MissingBackjump {
                        stack: jump.stack,
                        jump: jump.index,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn mobile(&self) -> SpeciesId {
        self.mobile
    }

    pub fn shells(&self) -> &ShellConfig {
        &self.shells
    }

    pub fn stack_count(&self) -> usize {
        self.jumps.len()
    }

    pub fn stack_jumps(&self, stack: usize) -> &[Jump] {
        &self.jumps[stack]
    }

    pub fn get(&self, stack: usize, index: usize) -> Option<&Jump> {
        self.jumps.get(stack).and_then(|l| l.get(index))
    }

    pub fn backjump_of(&self, jump: &Jump) -> &Jump {
        &self.jumps[jump.dest.s][jump.backjump]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Jump> {
        self.jumps.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.jumps.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records the class of a jump and aligns its environment with the
    /// canonical coordinate order: `env[i]` becomes the old `env[order[i]]`.
    pub(crate) fn assign_unique(
        &mut self,
        stack: usize,
        index: usize,
        unique: usize,
        order: &[usize],
    ) -> KmcResult<()> {
        let jump = &mut self.jumps[stack][index];
        if jump.unique.is_some() {
            return Err(KmcError::InvariantViolation(format!(
                "jump {} of stack {} classified twice",
                index, stack
            )));
        }
        if order.len() != jump.env.len() {
            return Err(KmcError::InvariantViolation(format!(
                "permutation of length {} for environment of length {}",
                order.len(),
                jump.env.len()
            )));
        }
        jump.env = order.iter().map(|&k| jump.env[k]).collect();
        jump.unique = Some(unique);
        Ok(())
    }

    pub(crate) fn partners_mut(&mut self, stack: usize, index: usize) -> &mut Vec<Partner> {
        &mut self.jumps[stack][index].partners
    }
}

fn discover<S: StructureService + ?Sized>(
    structure: &S,
    stack: usize,
    index: usize,
    dest: LatticePos,
    shells: &ShellConfig,
) -> KmcResult<Jump> {
    let start = LatticePos::origin(stack);
    let start_xyz = structure.to_cartesian(&start);
    let dest_xyz = structure.to_cartesian(&dest);
    let mid_xyz = (start_xyz + dest_xyz) * 0.5;
    let excluded = [start, dest];

    let mut env: Vec<LatticePos> = Vec::new();
    for (center, count, label) in [
        (start_xyz, shells.start, "start"),
        (mid_xyz, shells.mid, "transition"),
        (dest_xyz, shells.dest, "destination"),
    ] {
        if count == 0 {
            continue;
        }
        let found = structure.shell_search(center, count, None, &excluded)?;
        if found.is_empty() {
            return Err(KmcError::Structure(format!(
                "{} shell search of jump {} -> {} returned no neighbors",
                label, start, dest
            )));
        }
        for pos in found {
            if !env.contains(&pos) {
                env.push(pos);
            }
        }
    }

    let mut partners = Vec::new();
    if shells.interaction > 0 {
        let mut skip = env.clone();
        skip.extend_from_slice(&excluded);
        let found =
            structure.shell_search(mid_xyz, shells.mid + shells.interaction, None, &skip)?;
        for pos in found {
            if structure.occupants_at(pos.s).len() < 2 {
                continue;
            }
            let shell = structure.shell_search(
                structure.to_cartesian(&pos),
                shells.interaction_env.max(1),
                None,
                &[pos],
            )?;
            if shell.is_empty() {
                return Err(KmcError::Structure(format!(
                    "interaction partner {} of jump {} -> {} has no neighbors",
                    pos, start, dest
                )));
            }
            partners.push(Partner {
                pos,
                shell,
                interaction: None,
            });
        }
    }

    Ok(Jump {
        stack,
        index,
        dest,
        backjump: UNPAIRED,
        env,
        partners,
        unique: None,
    })
}
