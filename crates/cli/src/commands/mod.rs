pub mod strategies;
pub mod workers;
