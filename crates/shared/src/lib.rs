pub mod crypto;
pub mod models;

pub use models::*;
