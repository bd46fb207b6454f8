//! Human-readable dumps. All output labels live here.

use crate::mods::{
    classifier::ClassifiedNetwork,
    compiler::CompiledNetwork,
    results::PhaseResults,
    structure::{SpeciesId, SpeciesTable},
};
use std::io::{Result as IoResult, Write};

fn occupant_list(species: &SpeciesTable, occupants: &[SpeciesId]) -> String {
    occupants
        .iter()
        .map(|&s| species.symbol(s))
        .collect::<Vec<_>>()
        .join(",")
}

fn energy_list(species: &SpeciesTable, occupants: &[SpeciesId], energies: &[f64]) -> String {
    occupants
        .iter()
        .zip(energies)
        .map(|(&s, e)| format!("{}={:.6}", species.symbol(s), e))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn write_network<W: Write>(w: &mut W, network: &ClassifiedNetwork, species: &SpeciesTable) -> IoResult<()> {
    let jumps = network.jumps();
    let shells = jumps.shells();
    writeln!(w, "# Jump network")?;
    writeln!(w, "MobileSpecies: {}", species.symbol(jumps.mobile()))?;
    writeln!(
        w,
        "Shells: jump {} start {} mid {} dest {} interaction {} interaction_env {}",
        shells.jump, shells.start, shells.mid, shells.dest, shells.interaction, shells.interaction_env
    )?;
    writeln!(w, "Jumps: {}", jumps.len())?;
    writeln!(w, "UniqueJumps: {}", network.uniques().len())?;
    writeln!(w, "Interactions: {}", network.interactions().len())?;
    writeln!(w, "Coordinates: {}", network.coordinate_count())?;
    writeln!(w)?;

    for u in network.uniques() {
        writeln!(
            w,
            "UniqueJump {}: stack {} -> {} length {:.6} members {} active {} activation {:.6} eV",
            u.id,
            u.stack,
            u.dest,
            u.length,
            u.members.len(),
            u.active,
            u.activation_energy
        )?;
        for (local, c) in u.coords.iter().enumerate() {
            let raw = network.coordinate_id(u.id, local).unwrap_or(usize::MAX);
            let flag = match (c.ignored, c.additive) {
                (true, _) => "ignored",
                (false, true) => "additive",
                (false, false) => "coded",
            };
            writeln!(
                w,
                "  Coord {:>4} (raw {:>5}) {:<3} z {:>9.5} r {:>9.5} phi {:>8.3} {:<8} [{}] {}",
                local,
                raw,
                species.symbol(c.species),
                c.cyl.axial,
                c.cyl.radial,
                c.cyl.azimuth,
                flag,
                occupant_list(species, &c.occupants),
                energy_list(species, &c.occupants, &c.energies)
            )?;
        }
        if !u.interactions.is_empty() {
            let ids = u
                .interactions
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",");
            writeln!(w, "  Interactions: {}", ids)?;
        }
    }

    for i in network.interactions() {
        writeln!(
            w,
            "Interaction {}: {} d_start {:.6} d_dest {:.6} shell {}/{} [{}] {}",
            i.id,
            species.symbol(i.species),
            i.start_distance,
            i.dest_distance,
            i.start_shell().len(),
            i.dest_shell().len(),
            occupant_list(species, &i.occupants),
            energy_list(species, &i.occupants, &i.energies)
        )?;
    }
    Ok(())
}

pub fn write_compiled<W: Write>(w: &mut W, compiled: &CompiledNetwork) -> IoResult<()> {
    writeln!(w)?;
    writeln!(w, "# Compiled network")?;
    writeln!(w, "SimJumps: {}", compiled.jumps.len())?;
    writeln!(w, "SimUniqueJumps: {}", compiled.uniques.len())?;
    writeln!(w, "kT: {:.6e} eV", compiled.kt)?;
    writeln!(w, "AnalyticNormalization: {:.6e}", compiled.normalization)?;
    for (k, u) in compiled.uniques.iter().enumerate() {
        writeln!(
            w,
            "SimUniqueJump {} (unique {}): coded {} table {} max {:.6e}",
            k,
            u.source,
            u.encoder.len(),
            u.encoder.table_size(),
            u.max_factor
        )?;
    }
    Ok(())
}

pub fn write_results<W: Write>(w: &mut W, results: &[PhaseResults]) -> IoResult<()> {
    for r in results {
        let c = &r.counters;
        writeln!(w, "# {} phase", r.kind.name())?;
        writeln!(w, "MobileAtoms: {}", r.mobile_count)?;
        writeln!(w, "Steps: {}", c.steps)?;
        writeln!(w, "Attempts: {}", c.attempts)?;
        writeln!(w, "Blocked: {}", c.blocked)?;
        writeln!(w, "Overkill: {}", c.overkill)?;
        writeln!(w, "Nonsense: {}", c.nonsense)?;
        writeln!(w, "OverkillFraction: {:.6e}", r.overkill_fraction)?;
        writeln!(w, "MaxProbability: {:.6e}", r.max_probability)?;
        writeln!(w, "Normalization: {:.6e}", r.normalization)?;
        writeln!(w, "SimTime: {:.6e} s", r.sim_time)?;
        writeln!(w, "MSD: {:.6e} A^2", r.msd.total)?;
        writeln!(w, "MSDParallel: {:.6e} A^2", r.msd.parallel)?;
        writeln!(w, "MSDPerpendicular: {:.6e} A^2", r.msd.perpendicular)?;
        writeln!(w, "Drift: {:.6e} A", r.drift)?;
        writeln!(w, "Diffusion: {:.6e} cm^2/s", r.diffusion)?;
        writeln!(w, "Conductivity: {:.6e} S/cm", r.conductivity)?;
        writeln!(w, "Runtime: {:?}", r.runtime)?;
        writeln!(w)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mods::{
        congruence::Tolerance,
        jumps::{JumpCollection, ShellConfig},
        structure::tests::simple_cubic,
    };

    #[test]
    fn network_dump_lists_every_coordinate() {
        let cell = simple_cubic(1.0);
        let mut species = SpeciesTable::new();
        species.add(1, "Na", 1.0).expect("species");
        let jumps = JumpCollection::build(&cell, 1, ShellConfig::default()).expect("build");
        let network = ClassifiedNetwork::classify(&cell, jumps, Tolerance::default()).expect("classify");

        let mut buf = Vec::new();
        write_network(&mut buf, &network, &species).expect("write");
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.contains("UniqueJumps: 1"));
        assert_eq!(
            text.lines().filter(|l| l.trim_start().starts_with("Coord ")).count(),
            network.coordinate_count()
        );
        assert!(text.contains("[Na,Vac]"));
    }
}
