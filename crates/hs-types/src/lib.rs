pub mod config;
pub mod errors;
pub mod parameters;
pub mod trial;

pub use config::*;
pub use errors::*;
pub use parameters::*;
pub use trial::*;
