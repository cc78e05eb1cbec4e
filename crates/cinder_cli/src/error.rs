use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Cinder(#[from] cinder::error::Error),

    #[error("Could not set up logging: {0}")]
    Logging(String),

    #[error("Could not write `{0}`: {1}")]
    Write(PathBuf, std::io::Error),
}

impl Error {
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Cinder(e) => e.kind().exit_code() as u8,
            Error::Logging(_) => 2,
            Error::Write(..) => 3,
        }
    }
}
