use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unidentified table format: magic {0:#018x}")]
    UnsupportedTableFormat(u64),

    #[error("Arena allocation failed: requested {requested} bytes")]
    ArenaExhausted { requested: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
