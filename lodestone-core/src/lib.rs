pub mod crd;
pub mod error;

pub use error::Error;

/// Comma-separated list of canonical label selectors which match the
/// Lodestone Operator's labelling scheme.
pub const LODESTONE_OPERATOR_LABEL_SELECTORS: &str = "app=lodestone,lodestone.rs/controlled-by=lodestone-operator";
