use crate::mods::{
    classifier::ClassifiedNetwork,
    compiler::CompileParams,
    congruence::Tolerance,
    constants::{DEFAULT_EQ_THRESHOLD, DEFAULT_ZERO_THRESHOLD, VACANCY},
    engine::EngineConfig,
    error::KmcResult,
    geometry::Vec3,
    io_handler::get_exe_dir,
    jumps::ShellConfig,
    lattice::Doping,
    structure::{CellAtom, SpeciesId, SpeciesTable, UnitCell},
};
use std::{borrow::Cow, error::Error, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct SpeciesDef {
    pub id: SpeciesId,
    pub symbol: String,
    pub charge: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AtomDef {
    pub frac: Vec3,
    pub species: SpeciesId,
    /// Species besides the host that may occupy the site.
    pub alternatives: Vec<SpeciesId>,
}

/// One line of the energy configuration, applied to the classified network in
/// file order.
#[derive(Debug, Clone, PartialEq)]
pub enum EnergyEntry {
    Activation { unique: usize, energy: f64 },
    Coordinate { raw: usize, species: SpeciesId, energy: f64 },
    UniqueCoordinate { unique: usize, local: usize, species: SpeciesId, energy: f64 },
    Interaction { id: usize, species: SpeciesId, energy: f64 },
    Additive { unique: usize, local: usize },
    Ignore { unique: usize, local: usize },
    Deactivate { unique: usize },
}

impl EnergyEntry {
    pub fn apply(&self, network: &mut ClassifiedNetwork) -> KmcResult<()> {
        match *self {
            EnergyEntry::Activation { unique, energy } => network.set_activation_energy(unique, energy),
            EnergyEntry::Coordinate { raw, species, energy } => network.set_coordinate_energy(raw, species, energy),
            EnergyEntry::UniqueCoordinate {
                unique,
                local,
                species,
                energy,
            } => network.set_unique_coordinate_energy(unique, local, species, energy),
            EnergyEntry::Interaction { id, species, energy } => network.set_interaction_energy(id, species, energy),
            EnergyEntry::Additive { unique, local } => network.set_coordinate_additive(unique, local, true),
            EnergyEntry::Ignore { unique, local } => network.set_coordinate_ignored(unique, local, true),
            EnergyEntry::Deactivate { unique } => network.set_unique_active(unique, false),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub dir_prefix: String,
    pub seed: u64,

    pub sx: usize,
    pub sy: usize,
    pub sz: usize,

    pub cell_a: f64,
    pub cell_b: f64,
    pub cell_c: f64,
    pub cell_alpha: f64,
    pub cell_beta: f64,
    pub cell_gamma: f64,
    pub species: Vec<SpeciesDef>,
    pub atoms: Vec<AtomDef>,

    pub temperature: f64,
    pub attempt_frequency: f64,
    pub mobile_species: SpeciesId,
    pub field_x: f64,
    pub field_y: f64,
    pub field_z: f64,
    pub field_magnitude: f64,

    pub jump_shells: usize,
    pub start_shells: usize,
    pub mid_shells: usize,
    pub dest_shells: usize,
    pub interaction_shells: usize,
    pub interaction_env_shells: usize,
    pub eq_threshold: f64,
    pub zero_threshold: f64,

    pub energies: Vec<EnergyEntry>,
    pub dopings: Vec<Doping>,
    pub vacancy_count: usize,

    pub prerun_mcsp: f64,
    pub dyn_norm_attempts: u64,
    pub dyn_norm_outliers: u64,
    pub main_mcsp: f64,
    pub checkpoint_interval: u64,
    pub resume: bool,
    pub print_i: u64,

    pub src_path: PathBuf,
    pub dst_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        let exe_dir = get_exe_dir().unwrap_or_else(|_| PathBuf::from("."));

        Self {
            dir_prefix: "Default".to_string(),
            seed: 1012,

            sx: 8,
            sy: 8,
            sz: 8,

            cell_a: 1.0,
            cell_b: 1.0,
            cell_c: 1.0,
            cell_alpha: 90.0,
            cell_beta: 90.0,
            cell_gamma: 90.0,
            species: Vec::new(),
            atoms: Vec::new(),

            temperature: 300.0,
            attempt_frequency: 1.0e13,
            mobile_species: 1,
            field_x: 1.0,
            field_y: 0.0,
            field_z: 0.0,
            field_magnitude: 0.0,

            jump_shells: 1,
            start_shells: 1,
            mid_shells: 1,
            dest_shells: 1,
            interaction_shells: 0,
            interaction_env_shells: 1,
            eq_threshold: DEFAULT_EQ_THRESHOLD,
            zero_threshold: DEFAULT_ZERO_THRESHOLD,

            energies: Vec::new(),
            dopings: Vec::new(),
            vacancy_count: 1,

            prerun_mcsp: 0.0,
            dyn_norm_attempts: 0,
            dyn_norm_outliers: 0,
            main_mcsp: 10.0,
            checkpoint_interval: 0,
            resume: false,
            print_i: 0,

            src_path: exe_dir,
            dst_path: PathBuf::new(),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.sx == 0 {
            return Err(SettingsError::simple("Sx", "must be > 0"));
        }
        if self.sy == 0 {
            return Err(SettingsError::simple("Sy", "must be > 0"));
        }
        if self.sz == 0 {
            return Err(SettingsError::simple("Sz", "must be > 0"));
        }
        if self.cell_a <= 0.0 || self.cell_b <= 0.0 || self.cell_c <= 0.0 {
            return Err(SettingsError::simple("CellA/CellB/CellC", "must be > 0"));
        }
        for (key, angle) in [
            ("CellAlpha", self.cell_alpha),
            ("CellBeta", self.cell_beta),
            ("CellGamma", self.cell_gamma),
        ] {
            if !(angle > 0.0 && angle < 180.0) {
                return Err(SettingsError::simple(key, "must be in (0, 180) degrees"));
            }
        }
        if self.species.is_empty() {
            return Err(SettingsError::simple("Species", "at least one species is required"));
        }
        if self.atoms.is_empty() {
            return Err(SettingsError::simple("Atom", "at least one atom is required"));
        }
        for atom in &self.atoms {
            let known = |id: SpeciesId| id == VACANCY || self.species.iter().any(|s| s.id == id);
            if atom.species == VACANCY || !known(atom.species) {
                return Err(SettingsError::simple(
                    "Atom",
                    format!("undefined host species {}", atom.species),
                ));
            }
            if let Some(bad) = atom.alternatives.iter().find(|&&s| !known(s)) {
                return Err(SettingsError::simple("Atom", format!("undefined occupant species {}", bad)));
            }
        }
        if !self.species.iter().any(|s| s.id == self.mobile_species) {
            return Err(SettingsError::simple("MobileSpecies", "must name a defined species"));
        }
        if self.temperature <= 0.0 {
            return Err(SettingsError::simple("T", "must be > 0"));
        }
        if self.attempt_frequency <= 0.0 {
            return Err(SettingsError::simple("AttemptFrequency", "must be > 0"));
        }
        if self.field_magnitude < 0.0 {
            return Err(SettingsError::simple("FieldMagnitude", "must be >= 0"));
        }
        if self.jump_shells == 0 {
            return Err(SettingsError::simple("JumpShells", "must be > 0"));
        }
        if self.eq_threshold <= 0.0 || self.zero_threshold <= 0.0 {
            return Err(SettingsError::simple("EqThreshold/ZeroThreshold", "must be > 0"));
        }
        if self.prerun_mcsp < 0.0 || self.main_mcsp < 0.0 {
            return Err(SettingsError::simple("PrerunMcsp/MainMcsp", "must be >= 0"));
        }
        if self.dyn_norm_attempts > 0 && self.dyn_norm_outliers >= self.dyn_norm_attempts {
            return Err(SettingsError::simple("DynNormOutliers", "must be below DynNormAttempts"));
        }
        if self.dir_prefix.trim().is_empty() {
            return Err(SettingsError::simple("DirPrefix", "cannot be empty"));
        }
        Ok(())
    }

    pub fn species_table(&self) -> KmcResult<SpeciesTable> {
        let mut table = SpeciesTable::new();
        for s in &self.species {
            table.add(s.id, &s.symbol, s.charge)?;
        }
        Ok(table)
    }

    pub fn unit_cell(&self) -> KmcResult<UnitCell> {
        let vectors = UnitCell::vectors_from_parameters(
            self.cell_a,
            self.cell_b,
            self.cell_c,
            self.cell_alpha,
            self.cell_beta,
            self.cell_gamma,
        );
        let atoms = self
            .atoms
            .iter()
            .map(|a| {
                let mut occupants = vec![a.species];
                for &s in &a.alternatives {
                    if !occupants.contains(&s) {
                        occupants.push(s);
                    }
                }
                CellAtom {
                    frac: a.frac,
                    species: a.species,
                    occupants,
                }
            })
            .collect();
        UnitCell::new(vectors, atoms, self.zero_threshold)
    }

    pub fn shells(&self) -> ShellConfig {
        ShellConfig {
            jump: self.jump_shells,
            start: self.start_shells,
            mid: self.mid_shells,
            dest: self.dest_shells,
            interaction: self.interaction_shells,
            interaction_env: self.interaction_env_shells,
        }
    }

    pub fn tolerance(&self) -> Tolerance {
        Tolerance {
            eq: self.eq_threshold,
            zero: self.zero_threshold,
        }
    }

    pub fn compile_params(&self) -> CompileParams {
        CompileParams {
            temperature: self.temperature,
            attempt_frequency: self.attempt_frequency,
            field_direction: Vec3::new(self.field_x, self.field_y, self.field_z),
            field_magnitude: self.field_magnitude,
        }
    }

    pub fn engine_config(&self, checkpoint_path: Option<PathBuf>) -> EngineConfig {
        EngineConfig {
            seed: self.seed,
            prerun_mcsp: self.prerun_mcsp,
            dyn_norm_attempts: self.dyn_norm_attempts,
            dyn_norm_outliers: self.dyn_norm_outliers,
            main_mcsp: self.main_mcsp,
            checkpoint_interval: self.checkpoint_interval,
            print_interval: self.print_i,
            checkpoint_path,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to parse '{key}' with value '{value}': {source}")]
    Parse {
        key: Cow<'static, str>,
        value: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },

    #[error("Invalid value for '{key}': {message}")]
    Invalid { key: Cow<'static, str>, message: String },

    #[error("Settings error: {0}")]
    Io(#[from] std::io::Error),
}

impl SettingsError {
    pub fn new<K: Into<Cow<'static, str>>, V: Into<String>, E: Error + Send + Sync + 'static>(
        key: K,
        value: V,
        source: E,
    ) -> Self {
        Self::Parse {
            key: key.into(),
            value: value.into(),
            source: Box::new(source),
        }
    }

    pub fn simple<K: Into<Cow<'static, str>>, M: Into<String>>(key: K, message: M) -> Self {
        Self::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn from_io(err: std::io::Error) -> Self {
        Self::Io(err)
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Parse { key, .. } | Self::Invalid { key, .. } => Some(key),
            Self::Io(_) => None,
        }
    }
}
