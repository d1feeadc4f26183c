pub mod models;
pub mod speech;

pub use models::*;
pub use speech::*;
