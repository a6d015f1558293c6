pub mod run;
pub mod status;

pub use run::run_export;
pub use status::run_status;
