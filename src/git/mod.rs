mod runner;

pub use runner::GitRunner;
