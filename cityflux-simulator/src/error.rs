use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Encode Error - {0}")]
    Encode(String),

    #[error("Producer Error - {0}")]
    Producer(#[from] cityflux_core::Error),
}
