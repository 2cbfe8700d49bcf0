use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Manifest is empty")]
    Empty,

    #[error("Manifest does not start with the CACHE MANIFEST signature")]
    MissingSignature,
}
