//! Tagged line-oriented checkpoint of the simulation phases.
//!
//! ```text
//! RngSeed: 42
//! Lattice: 8 8 8 1
//! Created: 2026-01-01T00:00:00+00:00
//! <MAIN_PHASE>
//! TargetSteps: 1000
//! ...
//! <OCCUPATION>
//! 1:1:0:1
//! </OCCUPATION>
//! <DISPLACEMENT>
//! 0:0:0
//! </DISPLACEMENT>
//! <ATTEMPTED_HISTOGRAM>
//! 0.5: 12
//! </ATTEMPTED_HISTOGRAM>
//! <ACCEPTED_HISTOGRAM>
//! </ACCEPTED_HISTOGRAM>
//! </MAIN_PHASE>
//! ```
//!
//! Loading is strict: every block must be present, sizes must agree with the
//! header and histogram lines must be strictly descending.

use crate::mods::{
    compiler::CompiledNetwork,
    error::{KmcError, KmcResult},
    geometry::Vec3,
    lattice::{Lattice, species_counts},
    phase::{Histogram, PhaseCounters, PhaseKind, SimPhaseInfo},
    structure::SpeciesId,
};
use chrono::Utc;
use log::{debug, info};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufWriter, Result as IoResult, Write},
    path::Path,
    str::FromStr,
};

const OCCUPATION: &str = "OCCUPATION";
const DISPLACEMENT: &str = "DISPLACEMENT";
const ATTEMPTED: &str = "ATTEMPTED_HISTOGRAM";
const ACCEPTED: &str = "ACCEPTED_HISTOGRAM";

#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub seed: u64,
    /// `[nx, ny, nz, stacks]`
    pub lattice: [usize; 4],
    /// In phase order, at most one per kind.
    pub phases: Vec<SimPhaseInfo>,
}

impl Checkpoint {
    pub fn new(seed: u64, lattice: &Lattice) -> Self {
        Self {
            seed,
            lattice: [lattice.nx, lattice.ny, lattice.nz, lattice.stacks],
            phases: Vec::new(),
        }
    }

    pub fn last(&self) -> Option<&SimPhaseInfo> {
        self.phases.last()
    }

    pub fn phase(&self, kind: PhaseKind) -> Option<&SimPhaseInfo> {
        self.phases.iter().find(|p| p.kind == kind)
    }

    /// Replaces the stored snapshot of the same phase kind.
    pub fn upsert(&mut self, info: SimPhaseInfo) {
        match self.phases.iter_mut().find(|p| p.kind == info.kind) {
            Some(slot) => *slot = info,
            None => {
                self.phases.push(info);
                self.phases.sort_by_key(|p| p.kind);
            }
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> IoResult<()> {
        let [nx, ny, nz, stacks] = self.lattice;
        writeln!(w, "RngSeed: {}", self.seed)?;
        writeln!(w, "Lattice: {} {} {} {}", nx, ny, nz, stacks)?;
        writeln!(w, "Created: {}", Utc::now().to_rfc3339())?;

        for info in &self.phases {
            let tag = info.kind.tag();
            let c = &info.counters;
            writeln!(w, "<{}>", tag)?;
            writeln!(w, "TargetSteps: {}", info.target_steps)?;
            writeln!(w, "TargetAttempts: {}", info.target_attempts)?;
            writeln!(w, "Steps: {}", c.steps)?;
            writeln!(w, "Attempts: {}", c.attempts)?;
            writeln!(w, "Blocked: {}", c.blocked)?;
            writeln!(w, "Overkill: {}", c.overkill)?;
            writeln!(w, "Nonsense: {}", c.nonsense)?;
            writeln!(w, "SimTime: {}", info.sim_time)?;
            writeln!(w, "Normalization: {}", info.normalization)?;
            writeln!(w, "RngWordPos: {}", info.rng_word_pos)?;
            writeln!(w, "Completed: {}", info.completed)?;

            writeln!(w, "<{}>", OCCUPATION)?;
            let line = info
                .occupation
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(":");
            writeln!(w, "{}", line)?;
            writeln!(w, "</{}>", OCCUPATION)?;

            writeln!(w, "<{}>", DISPLACEMENT)?;
            for d in info.displacement.iter() {
                writeln!(w, "{}:{}:{}", d.x, d.y, d.z)?;
            }
            writeln!(w, "</{}>", DISPLACEMENT)?;

            for (block, histogram) in [(ATTEMPTED, &info.attempted), (ACCEPTED, &info.accepted)] {
                writeln!(w, "<{}>", block)?;
                for (p, count) in histogram.iter_descending() {
                    writeln!(w, "{}: {}", p, count)?;
                }
                writeln!(w, "</{}>", block)?;
            }
            writeln!(w, "</{}>", tag)?;
        }
        Ok(())
    }

    /// Writes to a sibling temporary file first and renames it over `path`,
    /// so the previous checkpoint survives an interrupted write.
    pub fn save(&self, path: &Path) -> KmcResult<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut buf = BufWriter::new(File::create(&tmp)?);
            self.write_to(&mut buf)?;
            buf.flush()?;
            buf.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!("checkpoint written to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> KmcResult<Self> {
        let text = fs::read_to_string(path)?;
        let checkpoint = Self::parse(&text)?;
        info!(
            "Checkpoint loaded from {} ({} phases)",
            path.display(),
            checkpoint.phases.len()
        );
        Ok(checkpoint)
    }

    pub fn parse(text: &str) -> KmcResult<Self> {
        let mut cur = Cursor::new(text);
        let seed = cur.scalar("RngSeed")?;

        let (line, dims) = cur.value("Lattice")?;
        let dims: Vec<usize> = dims
            .split_whitespace()
            .map(|t| t.parse::<usize>())
            .collect::<Result<_, _>>()
            .map_err(|e| KmcError::checkpoint(line, format!("bad lattice dimensions: {}", e)))?;
        let lattice: [usize; 4] = dims
            .try_into()
            .map_err(|_| KmcError::checkpoint(line, "lattice needs four dimensions"))?;
        let sites = lattice
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .filter(|&n| n > 0)
            .ok_or_else(|| KmcError::checkpoint(line, format!("lattice {:?} has no addressable size", lattice)))?;

        cur.value("Created")?;

        let mut phases: Vec<SimPhaseInfo> = Vec::new();
        while let Some((line, open)) = cur.peek() {
            let kind = open
                .strip_prefix('<')
                .and_then(|t| t.strip_suffix('>'))
                .and_then(PhaseKind::from_tag)
                .ok_or_else(|| KmcError::checkpoint(line, format!("expected a phase tag, found '{}'", open)))?;
            cur.advance();
            if phases.last().is_some_and(|p| p.kind >= kind) {
                return Err(KmcError::checkpoint(line, format!("phase {} out of order", kind.tag())));
            }
            phases.push(parse_phase(&mut cur, kind, sites)?);
            cur.close(kind.tag())?;
        }

        Ok(Self { seed, lattice, phases })
    }

    /// Checks that the checkpoint belongs to this run: same seed, same
    /// lattice, legal occupants and unchanged species counts in every phase.
    pub fn validate(
        &self,
        seed: u64,
        lattice: &Lattice,
        network: &CompiledNetwork,
        expected_counts: &BTreeMap<SpeciesId, usize>,
    ) -> KmcResult<()> {
        if self.seed != seed {
            return Err(KmcError::CheckpointMismatch(format!(
                "seed {} in checkpoint, {} configured",
                self.seed, seed
            )));
        }
        let dims = [lattice.nx, lattice.ny, lattice.nz, lattice.stacks];
        if self.lattice != dims {
            return Err(KmcError::CheckpointMismatch(format!(
                "lattice {:?} in checkpoint, {:?} configured",
                self.lattice, dims
            )));
        }
        for info in &self.phases {
            lattice.check_occupation(&info.occupation, network)?;
            let counts = species_counts(&info.occupation);
            if &counts != expected_counts {
                return Err(KmcError::CheckpointMismatch(format!(
                    "{} phase species counts {:?}, expected {:?}",
                    info.kind.name(),
                    counts,
                    expected_counts
                )));
            }
            if !(info.normalization > 0.0) || !info.normalization.is_finite() {
                return Err(KmcError::CheckpointMismatch(format!(
                    "{} phase normalization {}",
                    info.kind.name(),
                    info.normalization
                )));
            }
        }
        Ok(())
    }
}

fn parse_phase(cur: &mut Cursor, kind: PhaseKind, sites: usize) -> KmcResult<SimPhaseInfo> {
    let target_steps = cur.scalar("TargetSteps")?;
    let target_attempts = cur.scalar("TargetAttempts")?;
    let counters = PhaseCounters {
        steps: cur.scalar("Steps")?,
        attempts: cur.scalar("Attempts")?,
        blocked: cur.scalar("Blocked")?,
        overkill: cur.scalar("Overkill")?,
        nonsense: cur.scalar("Nonsense")?,
    };
    let sim_time = cur.scalar("SimTime")?;
    let normalization = cur.scalar("Normalization")?;
    let rng_word_pos = cur.scalar("RngWordPos")?;
    let completed = cur.scalar("Completed")?;

    cur.open(OCCUPATION)?;
    let (line, text) = cur.next_line()?;
    let occupation: Box<[SpeciesId]> = text
        .split(':')
        .map(|t| t.trim().parse::<SpeciesId>())
        .collect::<Result<_, _>>()
        .map_err(|e| KmcError::checkpoint(line, format!("bad occupation entry: {}", e)))?;
    if occupation.len() != sites {
        return Err(KmcError::checkpoint(
            line,
            format!("{} occupation entries for {} sites", occupation.len(), sites),
        ));
    }
    cur.close(OCCUPATION)?;

    cur.open(DISPLACEMENT)?;
    let mut displacement = Vec::with_capacity(sites);
    for _ in 0..sites {
        let (line, text) = cur.next_line()?;
        let v: Vec<f64> = text
            .split(':')
            .map(|t| t.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| KmcError::checkpoint(line, format!("bad displacement: {}", e)))?;
        match v.as_slice() {
            &[x, y, z] => displacement.push(Vec3::new(x, y, z)),
            _ => return Err(KmcError::checkpoint(line, "displacement needs three components")),
        }
    }
    cur.close(DISPLACEMENT)?;

    let attempted = parse_histogram(cur, ATTEMPTED)?;
    let accepted = parse_histogram(cur, ACCEPTED)?;

    Ok(SimPhaseInfo {
        kind,
        target_steps,
        target_attempts,
        counters,
        sim_time,
        normalization,
        rng_word_pos,
        occupation,
        displacement: displacement.into_boxed_slice(),
        attempted,
        accepted,
        completed,
    })
}

fn parse_histogram(cur: &mut Cursor, block: &str) -> KmcResult<Histogram> {
    cur.open(block)?;
    let mut histogram = Histogram::new();
    let mut previous = f64::INFINITY;
    let closing = format!("</{}>", block);
    loop {
        let (line, text) = cur.next_line()?;
        if text == closing {
            return Ok(histogram);
        }
        let (p, count) = text
            .split_once(':')
            .ok_or_else(|| KmcError::checkpoint(line, format!("expected 'probability: count', found '{}'", text)))?;
        let p: f64 = p
            .trim()
            .parse()
            .map_err(|e| KmcError::checkpoint(line, format!("bad probability: {}", e)))?;
        let count: u64 = count
            .trim()
            .parse()
            .map_err(|e| KmcError::checkpoint(line, format!("bad count: {}", e)))?;
        if !(p >= 0.0) || p >= previous {
            return Err(KmcError::checkpoint(line, "probabilities must be strictly descending"));
        }
        previous = p;
        histogram.insert(p, count);
    }
}

struct Cursor<'a> {
    lines: Vec<(usize, &'a str)>,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        let lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty())
            .collect();
        Self { lines, pos: 0 }
    }

    fn peek(&self) -> Option<(usize, &'a str)> {
        self.lines.get(self.pos).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn last_line(&self) -> usize {
        self.lines.last().map_or(0, |&(n, _)| n)
    }

    fn next_line(&mut self) -> KmcResult<(usize, &'a str)> {
        let next = self
            .peek()
            .ok_or_else(|| KmcError::checkpoint(self.last_line(), "unexpected end of file"))?;
        self.advance();
        Ok(next)
    }

    fn value(&mut self, key: &str) -> KmcResult<(usize, &'a str)> {
        let (line, text) = self.next_line()?;
        match text.split_once(':') {
            Some((k, v)) if k.trim() == key => Ok((line, v.trim())),
            _ => Err(KmcError::checkpoint(line, format!("expected '{}', found '{}'", key, text))),
        }
    }

    fn scalar<T: FromStr>(&mut self, key: &str) -> KmcResult<T>
    where
        T::Err: std::fmt::Display,
    {
        let (line, v) = self.value(key)?;
        v.parse()
            .map_err(|e| KmcError::checkpoint(line, format!("bad value for '{}': {}", key, e)))
    }

    fn expect_tag(&mut self, tag: String) -> KmcResult<()> {
        let (line, text) = self.next_line()?;
        if text == tag {
            Ok(())
        } else {
            Err(KmcError::checkpoint(line, format!("expected '{}', found '{}'", tag, text)))
        }
    }

    fn open(&mut self, block: &str) -> KmcResult<()> {
        self.expect_tag(format!("<{}>", block))
    }

    fn close(&mut self, block: &str) -> KmcResult<()> {
        self.expect_tag(format!("</{}>", block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_phase(kind: PhaseKind, sites: usize) -> SimPhaseInfo {
        let occupation: Box<[SpeciesId]> = (0..sites).map(|i| (i % 3 == 0) as SpeciesId).collect();
        let mut info = SimPhaseInfo::new(kind, 120, 0, 0.731_524_018_7, occupation);
        info.counters = PhaseCounters {
            steps: 57,
            attempts: 311,
            blocked: 4,
            overkill: 1,
            nonsense: 2,
        };
        info.sim_time = 3.25e-9;
        info.rng_word_pos = 12_345_678_901_234;
        info.displacement[1] = Vec3::new(0.1, -2.5, 1.0 / 3.0);
        info.attempted.insert(1.25, 1);
        info.attempted.insert(0.5, 20);
        info.attempted.insert(1.0e-7, 3);
        info.accepted.insert(0.5, 9);
        info
    }

    fn render(cp: &Checkpoint) -> String {
        let mut buf = Vec::new();
        cp.write_to(&mut buf).expect("write");
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn save_load_round_trip() {
        let mut cp = Checkpoint {
            seed: 99,
            lattice: [2, 2, 1, 2],
            phases: Vec::new(),
        };
        cp.upsert(sample_phase(PhaseKind::Main, 8));
        cp.upsert(sample_phase(PhaseKind::Prerun, 8));
        assert_eq!(cp.phases[0].kind, PhaseKind::Prerun);

        let parsed = Checkpoint::parse(&render(&cp)).expect("parse");
        assert_eq!(parsed, cp);
    }

    #[test]
    fn upsert_replaces_same_kind() {
        let mut cp = Checkpoint {
            seed: 1,
            lattice: [1, 1, 1, 4],
            phases: Vec::new(),
        };
        cp.upsert(sample_phase(PhaseKind::Main, 4));
        let mut later = sample_phase(PhaseKind::Main, 4);
        later.counters.steps = 99;
        cp.upsert(later);
        assert_eq!(cp.phases.len(), 1);
        assert_eq!(cp.last().map(|p| p.counters.steps), Some(99));
    }

    #[test]
    fn unsorted_histogram_is_rejected() {
        let cp = Checkpoint {
            seed: 1,
            lattice: [1, 1, 1, 4],
            phases: vec![sample_phase(PhaseKind::Main, 4)],
        };
        let text = render(&cp).replace("1.25: 1\n0.5: 20", "0.5: 20\n1.25: 1");
        let err = Checkpoint::parse(&text).unwrap_err();
        assert!(matches!(err, KmcError::Checkpoint { .. }));
        assert!(err.is_critical());
    }

    #[test]
    fn missing_block_is_rejected() {
        let cp = Checkpoint {
            seed: 1,
            lattice: [1, 1, 1, 4],
            phases: vec![sample_phase(PhaseKind::Main, 4)],
        };
        let text = render(&cp).replace("<ACCEPTED_HISTOGRAM>\n0.5: 9\n</ACCEPTED_HISTOGRAM>\n", "");
        assert!(Checkpoint::parse(&text).is_err());
    }

    #[test]
    fn oversized_lattice_header_is_a_format_error() {
        let text = format!("RngSeed: 1\nLattice: {} 2 1 1\nCreated: now\n", usize::MAX);
        let err = Checkpoint::parse(&text).unwrap_err();
        assert!(matches!(err, KmcError::Checkpoint { line: 2, .. }));
        let err = Checkpoint::parse("RngSeed: 1\nLattice: 4 0 4 1\nCreated: now\n").unwrap_err();
        assert!(matches!(err, KmcError::Checkpoint { line: 2, .. }));
    }

    #[test]
    fn wrong_occupation_size_is_rejected() {
        let cp = Checkpoint {
            seed: 1,
            lattice: [1, 1, 1, 4],
            phases: vec![sample_phase(PhaseKind::Main, 4)],
        };
        let text = render(&cp).replace("Lattice: 1 1 1 4", "Lattice: 1 1 1 5");
        assert!(Checkpoint::parse(&text).is_err());
    }

    #[test]
    fn duplicate_phase_is_rejected() {
        let cp = Checkpoint {
            seed: 1,
            lattice: [1, 1, 1, 4],
            phases: vec![sample_phase(PhaseKind::Main, 4), sample_phase(PhaseKind::Main, 4)],
        };
        assert!(Checkpoint::parse(&render(&cp)).is_err());
    }

    proptest! {
        #[test]
        fn floats_survive_the_text_form(
            time in 0.0f64..1.0e6,
            norm in 1.0e-30f64..1.0e30,
            dx in -1.0e3f64..1.0e3,
        ) {
            let mut info = sample_phase(PhaseKind::DynNorm, 4);
            info.sim_time = time;
            info.normalization = norm;
            info.displacement[2] = Vec3::new(dx, -dx, dx * 0.5);
            let cp = Checkpoint { seed: 5, lattice: [1, 1, 1, 4], phases: vec![info] };
            prop_assert_eq!(Checkpoint::parse(&render(&cp)).expect("parse"), cp);
        }
    }
}
