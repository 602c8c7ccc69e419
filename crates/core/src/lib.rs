pub mod codes;
pub mod error;
pub mod models;
pub mod parsing;
pub mod validation;

pub use error::{EinvError, EinvResult};
