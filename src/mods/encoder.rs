//! Mixed-radix perfect hash of a coded environment occupation.

use crate::mods::{
    constants::{MAX_CODE_TABLE_SIZE, MAX_SPECIES},
    error::{KmcError, KmcResult},
    structure::SpeciesId,
};

const NO_DIGIT: u8 = u8::MAX;

#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentEncoder {
    multipliers: Box<[usize]>,
    /// Flattened `[coordinate][species] -> digit`.
    digits: Box<[u8]>,
    /// Per coordinate, digit -> species.
    species: Vec<Vec<SpeciesId>>,
    size: usize,
}

impl EnvironmentEncoder {
    /// `occupants[k]` lists the species that may sit on coded coordinate `k`;
    /// their order defines the digit values.
    pub fn new(unique: usize, occupants: &[Vec<SpeciesId>]) -> KmcResult<Self> {
        let mut multipliers = Vec::with_capacity(occupants.len());
        let mut digits = vec![NO_DIGIT; occupants.len() * MAX_SPECIES];
        let mut size: usize = 1;

        for (k, list) in occupants.iter().enumerate() {
            if list.is_empty() {
                return Err(KmcError::InvariantViolation(format!(
                    "coded coordinate {} of unique jump {} has no occupant",
                    k, unique
                )));
            }
            multipliers.push(size);
            for (digit, &s) in list.iter().enumerate() {
                digits[k * MAX_SPECIES + s as usize] = digit as u8;
            }
            size = size
                .checked_mul(list.len())
                .filter(|&n| n <= MAX_CODE_TABLE_SIZE)
                .ok_or(KmcError::CodeTableTooLarge {
                    unique,
                    size: size.saturating_mul(list.len()),
                })?;
        }

        Ok(Self {
            multipliers: multipliers.into_boxed_slice(),
            digits: digits.into_boxed_slice(),
            species: occupants.to_vec(),
            size,
        })
    }

    pub fn len(&self) -> usize {
        self.multipliers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.multipliers.is_empty()
    }

    pub fn table_size(&self) -> usize {
        self.size
    }

    /// Hot-loop form: `occupant(k)` yields the species on coded coordinate `k`,
    /// which must be one of its listed occupants.
    #[inline(always)]
    pub fn encode_with<F: Fn(usize) -> SpeciesId>(&self, occupant: F) -> usize {
        let mut code = 0;
        for (k, &m) in self.multipliers.iter().enumerate() {
            let digit = self.digits[k * MAX_SPECIES + occupant(k) as usize];
            debug_assert!(digit != NO_DIGIT);
            code += digit as usize * m;
        }
        code
    }

    pub fn encode(&self, occupation: &[SpeciesId]) -> Option<usize> {
        if occupation.len() != self.len() {
            return None;
        }
        let mut code = 0;
        for (k, (&s, &m)) in occupation.iter().zip(self.multipliers.iter()).enumerate() {
            let digit = *self.digits.get(k * MAX_SPECIES + s as usize)?;
            if digit == NO_DIGIT {
                return None;
            }
            code += digit as usize * m;
        }
        Some(code)
    }

    pub fn decode(&self, mut code: usize) -> Option<Vec<SpeciesId>> {
        if code >= self.size {
            return None;
        }
        let mut occupation = Vec::with_capacity(self.len());
        for list in &self.species {
            occupation.push(list[code % list.len()]);
            code /= list.len();
        }
        Some(occupation)
    }

    pub fn occupants(&self, coordinate: usize) -> &[SpeciesId] {
        &self.species[coordinate]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_encoder_has_single_code() {
        let enc = EnvironmentEncoder::new(0, &[]).expect("encoder");
        assert_eq!(enc.table_size(), 1);
        assert_eq!(enc.encode(&[]), Some(0));
        assert_eq!(enc.decode(0), Some(vec![]));
    }

    #[test]
    fn codes_are_dense_and_unique() {
        let enc = EnvironmentEncoder::new(0, &[vec![1, 0], vec![2, 3, 0], vec![5]]).expect("encoder");
        assert_eq!(enc.table_size(), 6);
        let mut seen = vec![false; 6];
        for code in 0..6 {
            let occ = enc.decode(code).expect("decode");
            assert_eq!(enc.encode(&occ), Some(code));
            seen[code] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn foreign_species_do_not_encode() {
        let enc = EnvironmentEncoder::new(0, &[vec![1, 0]]).expect("encoder");
        assert_eq!(enc.encode(&[4]), None);
        assert_eq!(enc.encode(&[1, 0]), None);
        assert_eq!(enc.decode(2), None);
    }

    #[test]
    fn oversized_tables_are_rejected() {
        let lists = vec![vec![0, 1, 2, 3]; 13];
        let err = EnvironmentEncoder::new(7, &lists).unwrap_err();
        assert!(matches!(err, KmcError::CodeTableTooLarge { unique: 7, .. }));
        assert!(!err.is_critical());
    }

    proptest! {
        #[test]
        fn encode_decode_round_trip(
            radices in prop::collection::vec(1usize..4, 0..8),
            picks in prop::collection::vec(0usize..4, 8),
        ) {
            let lists: Vec<Vec<SpeciesId>> = radices
                .iter()
                .enumerate()
                .map(|(k, &r)| (0..r).map(|d| ((k * 3 + d) % 10) as SpeciesId).collect())
                .collect();
            let enc = EnvironmentEncoder::new(0, &lists).expect("encoder");
            let occ: Vec<SpeciesId> = lists.iter().zip(&picks).map(|(l, &p)| l[p % l.len()]).collect();
            let code = enc.encode(&occ).expect("encode");
            prop_assert!(code < enc.table_size());
            prop_assert_eq!(enc.encode_with(|k| occ[k]), code);
            prop_assert_eq!(enc.decode(code).expect("decode"), occ);
        }
    }
}
