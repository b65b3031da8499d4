// src/lib.rs
pub use msicore::error::{MsiError, Result};

pub mod config;

pub mod exchange {
    pub mod nrrd;
    pub mod points;
    pub mod parameters;
    pub mod workdir;
    pub mod executable;
}

pub mod registration {
    pub mod defaults;
    pub mod process;
    pub mod orchestrator;
}

pub mod stack {
    pub mod slice_stack;
    pub mod query;
}
