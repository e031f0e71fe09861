pub mod controller;
pub mod error_classifier;

pub use controller::*;
pub use error_classifier::*;
