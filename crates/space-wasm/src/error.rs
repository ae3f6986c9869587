use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Bridge(#[from] space_bridge::Error),
    #[error("failed to compile module: {0}")]
    Compile(#[from] wasmer::CompileError),
    #[error("failed to instantiate module: {0}")]
    Instantiation(#[from] wasmer::InstantiationError),
    #[error("missing export: {0}")]
    Export(#[from] wasmer::ExportError),
    #[error("guest trapped: {0}")]
    Runtime(#[from] wasmer::RuntimeError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
