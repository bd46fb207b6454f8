use crate::mods::{
    classifier::ClassifiedNetwork,
    compiler::CompiledNetwork,
    constants::{COMMENT_LINE, CONFIG_FILE_NAME, MAX_SPECIES, NETWORK_FILE_NAME, RESULTS_FILE_NAME, VACANCY},
    geometry::Vec3,
    lattice::Doping,
    render,
    results::PhaseResults,
    settings::{AtomDef, EnergyEntry, Settings, SettingsError, SpeciesDef},
    structure::{SpeciesId, SpeciesTable},
};
use chrono::Utc;
use log::warn;
use std::{
    collections::HashMap,
    env::current_exe,
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Write},
    path::{Path, PathBuf},
};

use evalexpr::{eval_boolean, eval_number};

type Parser = Box<dyn Fn(&str, &mut Settings) -> Result<(), SettingsError>>;

macro_rules! parse_and_assign_eval {
    ($map:expr, $field:ident, $type:ty, $key:expr, boolean) => {
        $map.insert(
            $key,
            Box::new(|v: &str, s: &mut Settings| {
                let val = eval_boolean(v).map_err(|e| SettingsError::new($key, v, e))?;
                s.$field = val as $type;
                Ok(())
            }),
        );
    };

    ($map:expr, $field:ident, $type:ty, $key:expr, number) => {
        $map.insert(
            $key,
            Box::new(|v: &str, s: &mut Settings| {
                let val = eval_number(v).map_err(|e| SettingsError::new($key, v, e))?;
                s.$field = val as $type;
                Ok(())
            }),
        );
    };

    ($map:expr, $key:expr, list, $parse:expr) => {
        $map.insert(
            $key,
            Box::new(|v: &str, s: &mut Settings| {
                let fields = split_fields(v);
                $parse(&fields, v, s)
            }),
        );
    };
}

fn split_fields(value: &str) -> Vec<&str> {
    value.split(',').map(str::trim).filter(|f| !f.is_empty()).collect()
}

fn expect_fields(key: &'static str, value: &str, fields: &[&str], min: usize, max: usize) -> Result<(), SettingsError> {
    if fields.len() < min || fields.len() > max {
        let wanted = if min == max {
            format!("{}", min)
        } else if max == usize::MAX {
            format!("at least {}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return Err(SettingsError::simple(
            key,
            format!("expected {} fields, got {} in '{}'", wanted, fields.len(), value),
        ));
    }
    Ok(())
}

fn number(key: &'static str, field: &str) -> Result<f64, SettingsError> {
    eval_number(field).map_err(|e| SettingsError::new(key, field, e))
}

fn index(key: &'static str, field: &str) -> Result<usize, SettingsError> {
    let val = number(key, field)?;
    if !val.is_finite() || val < 0.0 || val.fract() != 0.0 {
        return Err(SettingsError::simple(
            key,
            format!("'{}' is not a non-negative integer", field),
        ));
    }
    Ok(val as usize)
}

fn species_id(key: &'static str, field: &str) -> Result<SpeciesId, SettingsError> {
    let id = index(key, field)?;
    if id >= MAX_SPECIES {
        return Err(SettingsError::simple(
            key,
            format!("species id {} exceeds {}", id, MAX_SPECIES - 1),
        ));
    }
    Ok(id as SpeciesId)
}

fn parse_species(fields: &[&str], value: &str, s: &mut Settings) -> Result<(), SettingsError> {
    expect_fields("Species", value, fields, 3, 3)?;
    let id = species_id("Species", fields[0])?;
    if id == VACANCY {
        return Err(SettingsError::simple("Species", "id 0 is reserved for vacancies"));
    }
    if s.species.iter().any(|d| d.id == id) {
        return Err(SettingsError::simple("Species", format!("duplicate species id {}", id)));
    }
    s.species.push(SpeciesDef {
        id,
        symbol: fields[1].to_string(),
        charge: number("Species", fields[2])?,
    });
    Ok(())
}

fn parse_atom(fields: &[&str], value: &str, s: &mut Settings) -> Result<(), SettingsError> {
    expect_fields("Atom", value, fields, 4, usize::MAX)?;
    let frac = Vec3::new(
        number("Atom", fields[0])?,
        number("Atom", fields[1])?,
        number("Atom", fields[2])?,
    );
    let species = species_id("Atom", fields[3])?;
    let alternatives = fields[4..]
        .iter()
        .map(|f| species_id("Atom", f))
        .collect::<Result<Vec<_>, _>>()?;
    s.atoms.push(AtomDef {
        frac,
        species,
        alternatives,
    });
    Ok(())
}

fn parse_doping(fields: &[&str], value: &str, s: &mut Settings) -> Result<(), SettingsError> {
    expect_fields("Doping", value, fields, 3, 4)?;
    let vacancies_per_dopant = match fields.get(3) {
        Some(f) => number("Doping", f)?,
        None => 0.0,
    };
    if vacancies_per_dopant < 0.0 {
        return Err(SettingsError::simple("Doping", "vacancies per dopant must be >= 0"));
    }
    s.dopings.push(Doping {
        dopant: species_id("Doping", fields[0])?,
        host: species_id("Doping", fields[1])?,
        count: index("Doping", fields[2])?,
        vacancies_per_dopant,
    });
    Ok(())
}

fn parse_activation(fields: &[&str], value: &str, s: &mut Settings) -> Result<(), SettingsError> {
    expect_fields("ActivationEnergy", value, fields, 2, 2)?;
    s.energies.push(EnergyEntry::Activation {
        unique: index("ActivationEnergy", fields[0])?,
        energy: number("ActivationEnergy", fields[1])?,
    });
    Ok(())
}

fn parse_coord_energy(fields: &[&str], value: &str, s: &mut Settings) -> Result<(), SettingsError> {
    expect_fields("CoordEnergy", value, fields, 3, 3)?;
    s.energies.push(EnergyEntry::Coordinate {
        raw: index("CoordEnergy", fields[0])?,
        species: species_id("CoordEnergy", fields[1])?,
        energy: number("CoordEnergy", fields[2])?,
    });
    Ok(())
}

fn parse_unique_coord_energy(fields: &[&str], value: &str, s: &mut Settings) -> Result<(), SettingsError> {
    expect_fields("UniqueCoordEnergy", value, fields, 4, 4)?;
    s.energies.push(EnergyEntry::UniqueCoordinate {
        unique: index("UniqueCoordEnergy", fields[0])?,
        local: index("UniqueCoordEnergy", fields[1])?,
        species: species_id("UniqueCoordEnergy", fields[2])?,
        energy: number("UniqueCoordEnergy", fields[3])?,
    });
    Ok(())
}

fn parse_interaction_energy(fields: &[&str], value: &str, s: &mut Settings) -> Result<(), SettingsError> {
    expect_fields("InteractionEnergy", value, fields, 3, 3)?;
    s.energies.push(EnergyEntry::Interaction {
        id: index("InteractionEnergy", fields[0])?,
        species: species_id("InteractionEnergy", fields[1])?,
        energy: number("InteractionEnergy", fields[2])?,
    });
    Ok(())
}

fn parse_additive(fields: &[&str], value: &str, s: &mut Settings) -> Result<(), SettingsError> {
    expect_fields("Additive", value, fields, 2, 2)?;
    s.energies.push(EnergyEntry::Additive {
        unique: index("Additive", fields[0])?,
        local: index("Additive", fields[1])?,
    });
    Ok(())
}

fn parse_ignore(fields: &[&str], value: &str, s: &mut Settings) -> Result<(), SettingsError> {
    expect_fields("Ignore", value, fields, 2, 2)?;
    s.energies.push(EnergyEntry::Ignore {
        unique: index("Ignore", fields[0])?,
        local: index("Ignore", fields[1])?,
    });
    Ok(())
}

fn parse_deactivate(fields: &[&str], value: &str, s: &mut Settings) -> Result<(), SettingsError> {
    expect_fields("Deactivate", value, fields, 1, 1)?;
    s.energies.push(EnergyEntry::Deactivate {
        unique: index("Deactivate", fields[0])?,
    });
    Ok(())
}

fn dispatch_table() -> HashMap<&'static str, Parser> {
    let mut dispatch: HashMap<&str, Parser> = HashMap::new();

    dispatch.insert(
        "DirPrefix",
        Box::new(|v, s| {
            s.dir_prefix = v.to_string();
            Ok(())
        }),
    );
    parse_and_assign_eval!(dispatch, seed, u64, "Seed", number);

    parse_and_assign_eval!(dispatch, sx, usize, "Sx", number);
    parse_and_assign_eval!(dispatch, sy, usize, "Sy", number);
    parse_and_assign_eval!(dispatch, sz, usize, "Sz", number);

    parse_and_assign_eval!(dispatch, cell_a, f64, "CellA", number);
    parse_and_assign_eval!(dispatch, cell_b, f64, "CellB", number);
    parse_and_assign_eval!(dispatch, cell_c, f64, "CellC", number);
    parse_and_assign_eval!(dispatch, cell_alpha, f64, "CellAlpha", number);
    parse_and_assign_eval!(dispatch, cell_beta, f64, "CellBeta", number);
    parse_and_assign_eval!(dispatch, cell_gamma, f64, "CellGamma", number);
    parse_and_assign_eval!(dispatch, "Species", list, parse_species);
    parse_and_assign_eval!(dispatch, "Atom", list, parse_atom);

    parse_and_assign_eval!(dispatch, temperature, f64, "T", number);
    parse_and_assign_eval!(dispatch, attempt_frequency, f64, "AttemptFrequency", number);
    dispatch.insert(
        "MobileSpecies",
        Box::new(|v: &str, s: &mut Settings| {
            s.mobile_species = species_id("MobileSpecies", v)?;
            Ok(())
        }),
    );
    parse_and_assign_eval!(dispatch, field_x, f64, "FieldX", number);
    parse_and_assign_eval!(dispatch, field_y, f64, "FieldY", number);
    parse_and_assign_eval!(dispatch, field_z, f64, "FieldZ", number);
    parse_and_assign_eval!(dispatch, field_magnitude, f64, "FieldMagnitude", number);

    parse_and_assign_eval!(dispatch, jump_shells, usize, "JumpShells", number);
    parse_and_assign_eval!(dispatch, start_shells, usize, "StartShells", number);
    parse_and_assign_eval!(dispatch, mid_shells, usize, "MidShells", number);
    parse_and_assign_eval!(dispatch, dest_shells, usize, "DestShells", number);
    parse_and_assign_eval!(dispatch, interaction_shells, usize, "InteractionShells", number);
    parse_and_assign_eval!(dispatch, interaction_env_shells, usize, "InteractionEnvShells", number);
    parse_and_assign_eval!(dispatch, eq_threshold, f64, "EqThreshold", number);
    parse_and_assign_eval!(dispatch, zero_threshold, f64, "ZeroThreshold", number);

    parse_and_assign_eval!(dispatch, "ActivationEnergy", list, parse_activation);
    parse_and_assign_eval!(dispatch, "CoordEnergy", list, parse_coord_energy);
    parse_and_assign_eval!(dispatch, "UniqueCoordEnergy", list, parse_unique_coord_energy);
    parse_and_assign_eval!(dispatch, "InteractionEnergy", list, parse_interaction_energy);
    parse_and_assign_eval!(dispatch, "Additive", list, parse_additive);
    parse_and_assign_eval!(dispatch, "Ignore", list, parse_ignore);
    parse_and_assign_eval!(dispatch, "Deactivate", list, parse_deactivate);
    parse_and_assign_eval!(dispatch, "Doping", list, parse_doping);
    parse_and_assign_eval!(dispatch, vacancy_count, usize, "VacancyCount", number);

    parse_and_assign_eval!(dispatch, prerun_mcsp, f64, "PrerunMcsp", number);
    parse_and_assign_eval!(dispatch, dyn_norm_attempts, u64, "DynNormAttempts", number);
    parse_and_assign_eval!(dispatch, dyn_norm_outliers, u64, "DynNormOutliers", number);
    parse_and_assign_eval!(dispatch, main_mcsp, f64, "MainMcsp", number);
    parse_and_assign_eval!(dispatch, checkpoint_interval, u64, "CheckpointInterval", number);
    parse_and_assign_eval!(dispatch, resume, bool, "Resume", boolean);
    parse_and_assign_eval!(dispatch, print_i, u64, "PrintI", number);

    dispatch
}

/// Reads `Key: value` lines into `cfg` until the comment sentinel. List keys
/// may repeat and append in file order.
pub fn parse_config<R: BufRead>(cfg: &mut Settings, reader: R) -> Result<(), SettingsError> {
    let dispatch = dispatch_table();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let trimmed = line.trim();

        if trimmed == COMMENT_LINE {
            break;
        }
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mut parts = trimmed.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();

        if key.is_empty() || value.is_empty() {
            warn!("Malformed line {}: '{}'", line_num + 1, line);
            continue;
        }

        if let Some(parser) = dispatch.get(key) {
            parser(value, cfg)?;
        } else {
            warn!("Unknown cfg key '{}' found on line {}: '{}'", key, line_num + 1, line);
        }
    }

    Ok(())
}

pub fn load_config(cfg: &mut Settings, path: &Path) -> Result<(), SettingsError> {
    let file = File::open(path).map_err(|e| {
        SettingsError::from_io(IoError::new(
            e.kind(),
            format!("Failed to open config '{}': {}", path.display(), e),
        ))
    })?;
    parse_config(cfg, BufReader::new(file))?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        cfg.src_path = dir.to_path_buf();
    }
    Ok(())
}

pub fn get_exe_dir() -> IoResult<PathBuf> {
    let exe_path = current_exe()?;

    exe_path.parent().map(|p| p.to_path_buf()).ok_or_else(|| {
        IoError::new(
            ErrorKind::Other,
            "Failed to get the parent directory of the executable.",
        )
    })
}

fn create_dir_name(cfg: &Settings) -> String {
    let timestamp = Utc::now().timestamp_micros();

    let base = format!(
        "{}_{}_X{}Y{}Z{}_T{:e}",
        timestamp, cfg.dir_prefix, cfg.sx, cfg.sy, cfg.sz, cfg.temperature,
    );

    match cfg.field_magnitude > 0.0 {
        true => format!("{}_E{:e}", base, cfg.field_magnitude),
        false => base,
    }
}

pub fn prepare_main_dir(cfg: &Settings) -> IoResult<PathBuf> {
    let dir_name = create_dir_name(cfg);
    let res_dir = cfg.src_path.join(&dir_name);

    fs::create_dir_all(&res_dir).map_err(|e| {
        IoError::new(
            e.kind(),
            format!("Failed to create directory '{}': {}", res_dir.display(), e),
        )
    })?;

    Ok(res_dir)
}

pub fn prepare_files(cfg: &Settings, config_path: &Path) -> IoResult<()> {
    let path_dst_config = cfg.dst_path.join(CONFIG_FILE_NAME);

    if config_path.exists() {
        fs::copy(config_path, &path_dst_config).map_err(|e| {
            IoError::new(
                e.kind(),
                format!(
                    "Failed to copy config from '{}' to '{}': {}",
                    config_path.display(),
                    path_dst_config.display(),
                    e
                ),
            )
        })?;
    } else {
        warn!(
            "Configuration file '{}' not found, skipping copy.",
            config_path.display()
        );
    }

    Ok(())
}

pub fn write_network_file(
    dir: &Path,
    network: &ClassifiedNetwork,
    compiled: &CompiledNetwork,
    species: &SpeciesTable,
) -> IoResult<PathBuf> {
    let path = dir.join(NETWORK_FILE_NAME);
    let mut writer = BufWriter::new(File::create(&path)?);
    render::write_network(&mut writer, network, species)?;
    render::write_compiled(&mut writer, compiled)?;
    writer.flush()?;
    Ok(path)
}

pub fn write_results_file(dir: &Path, results: &[PhaseResults]) -> IoResult<PathBuf> {
    let path = dir.join(RESULTS_FILE_NAME);
    let mut writer = BufWriter::new(File::create(&path)?);
    render::write_results(&mut writer, results)?;
    writer.flush()?;
    Ok(path)
}
