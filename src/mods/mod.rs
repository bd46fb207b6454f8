pub mod checkpoint;
pub mod classifier;
pub mod compiler;
pub mod congruence;
pub mod constants;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod io_handler;
pub mod jumps;
pub mod lattice;
pub mod phase;
pub mod render;
pub mod results;
pub mod settings;
pub mod structure;
pub mod vacancies;
