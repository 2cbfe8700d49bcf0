// Cache manifest parser implementation
pub mod error;
pub mod manifest;
pub mod parser;

// Export common types for ease of use
pub use error::ManifestError;
pub use manifest::{Manifest, Namespace};
pub use parser::{MANIFEST_SIGNATURE, parse};
