/// Boltzmann constant in electron volts per Kelvin.
pub const K_BOLTZMANN_EV: f64 = 8.617333262e-5;

/// Elementary charge in Coulomb.
pub const ELEMENTARY_CHARGE: f64 = 1.602176634e-19;

/// Angstrom^-1 to cm^-1.
pub const PER_ANGSTROM_TO_PER_CM: f64 = 1.0e8;

/// Species id reserved for an empty site.
pub const VACANCY: u8 = 0;

/// Upper bound for species ids, sizes the per-species lookup rows of the compiled network.
pub const MAX_SPECIES: usize = 64;

/// Largest joint-occupation table a single unique jump may compile to.
pub const MAX_CODE_TABLE_SIZE: usize = 1 << 24;

pub const DEFAULT_EQ_THRESHOLD: f64 = 1.0e-4;
pub const DEFAULT_ZERO_THRESHOLD: f64 = 1.0e-6;

pub const CONFIG_FILE_NAME: &str = "InitSettings.ini";
pub const NETWORK_FILE_NAME: &str = "Network.txt";
pub const CHECKPOINT_FILE_NAME: &str = "Checkpoint.txt";
pub const RESULTS_FILE_NAME: &str = "Results.txt";
pub const COMMENT_LINE: &str = "/////////////////////////////// | GENERAL INFO | ///////////////////////////////";
