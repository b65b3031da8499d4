// error module
pub mod error;

// data module
pub mod data {
    pub mod image;
    pub mod points;
    pub mod spectrum;
    pub mod spectral_image;
    pub mod continuous;
}

// algorithm module
pub mod algorithm {
    pub mod processing;
    pub mod binning;
}
