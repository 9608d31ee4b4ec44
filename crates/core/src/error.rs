use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid content structure: {0}")]
    InvalidContentStructure(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
