use ion_kmc::mods::{
    checkpoint::Checkpoint,
    classifier::ClassifiedNetwork,
    compiler::CompiledNetwork,
    constants::{CHECKPOINT_FILE_NAME, CONFIG_FILE_NAME},
    engine::SimulationEngine,
    io_handler,
    jumps::JumpCollection,
    lattice::Lattice,
    settings::Settings,
};

use std::{env, path::PathBuf, time::Instant};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let sta1 = Instant::now();

    let sta2 = Instant::now();

    let config_path = match env::args_os().nth(1) {
        Some(p) => PathBuf::from(p),
        None => io_handler::get_exe_dir()?.join(CONFIG_FILE_NAME),
    };

    let mut cfg = Settings::new();
    if let Err(e) = io_handler::load_config(&mut cfg, &config_path).and_then(|_| cfg.validate()) {
        eprintln!("❌ Error: {}", e);
        std::process::exit(1)
    }

    println!("DirPrefix: {:?}", cfg.dir_prefix);
    println!("Seed: {:?};", cfg.seed);
    println!("Sx: {:?}; Sy: {:?}; Sz: {:?};", cfg.sx, cfg.sy, cfg.sz);
    println!(
        "Cell: a {:.5e}; b {:.5e}; c {:.5e}; alpha {:.3}; beta {:.3}; gamma {:.3};",
        cfg.cell_a, cfg.cell_b, cfg.cell_c, cfg.cell_alpha, cfg.cell_beta, cfg.cell_gamma
    );
    println!("Species: {:?}; Atoms: {:?};", cfg.species.len(), cfg.atoms.len());
    println!(
        "T: {:.5e}; AttemptFrequency: {:.5e}; MobileSpecies: {:?};",
        cfg.temperature, cfg.attempt_frequency, cfg.mobile_species
    );
    println!(
        "Field: ({:.5e}, {:.5e}, {:.5e}) x {:.5e};",
        cfg.field_x, cfg.field_y, cfg.field_z, cfg.field_magnitude
    );
    println!(
        "Dopings: {:?}; VacancyCount: {:?}; EnergyEntries: {:?};",
        cfg.dopings.len(),
        cfg.vacancy_count,
        cfg.energies.len()
    );
    println!(
        "PrerunMcsp: {:?}; DynNormAttempts: {:?}; DynNormOutliers: {:?}; MainMcsp: {:?};",
        cfg.prerun_mcsp, cfg.dyn_norm_attempts, cfg.dyn_norm_outliers, cfg.main_mcsp
    );
    println!(
        "CheckpointInterval: {:?}; PrintI: {:?}; Resume: {:?};",
        cfg.checkpoint_interval, cfg.print_i, cfg.resume
    );

    let species = cfg.species_table()?;
    let cell = cfg.unit_cell()?;
    let jumps = JumpCollection::build(&cell, cfg.mobile_species, cfg.shells())?;
    println!("🔗 Jumps: {}", jumps.len());

    let mut network = ClassifiedNetwork::classify(&cell, jumps, cfg.tolerance())?;
    for entry in &cfg.energies {
        entry.apply(&mut network)?;
    }
    println!(
        "🔗 Unique jumps: {}; Interactions: {};",
        network.uniques().len(),
        network.interactions().len()
    );

    let compiled = CompiledNetwork::compile(&network, &cell, &species, cfg.compile_params())?;

    cfg.dst_path = io_handler::prepare_main_dir(&cfg).unwrap_or_else(|e| {
        eprintln!("❌ Failed to create output directory: {}", e);
        std::process::exit(1);
    });
    println!("📁 DST Path: {}", cfg.dst_path.display());

    io_handler::prepare_files(&cfg, &config_path).unwrap_or_else(|e| {
        eprintln!("❌ Failed to prepare files: {}", e);
        std::process::exit(1);
    });
    io_handler::write_network_file(&cfg.dst_path, &network, &compiled, &species)?;

    let lattice = Lattice::new(cfg.sx, cfg.sy, cfg.sz, compiled.stack_count())?;
    let engine_cfg = cfg.engine_config(Some(cfg.dst_path.join(CHECKPOINT_FILE_NAME)));
    let mut engine = SimulationEngine::new(compiled, lattice, engine_cfg)?;
    engine.initialize(&cfg.dopings, cfg.vacancy_count)?;

    if cfg.resume {
        let path = cfg.src_path.join(CHECKPOINT_FILE_NAME);
        println!("Attempting to resume from '{}'", path.display());

        let checkpoint = Checkpoint::load(&path).and_then(|c| engine.resume(c));
        if let Err(e) = checkpoint {
            eprintln!("❌ Failed to resume: {}", e);
            std::process::exit(1);
        }
        println!("Checkpoint loaded successfully.");
    }

    let fin2 = sta2.elapsed();
    println!("✅ Preparation DONE! (Time: {:?})", fin2);

    engine.run()?;

    let path = io_handler::write_results_file(&cfg.dst_path, engine.all_results())?;
    for r in engine.all_results() {
        println!(
            "📈 {}: D {:.5e} cm^2/s; sigma {:.5e} S/cm; steps {}; attempts {};",
            r.kind.name(),
            r.diffusion,
            r.conductivity,
            r.counters.steps,
            r.counters.attempts
        );
    }
    println!("📄 Results: {}", path.display());

    let fin1 = sta1.elapsed();
    println!("✅ All DONE! (Time: {:?})", fin1);

    Ok(())
}
