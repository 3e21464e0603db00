use thiserror::Error;

#[derive(Debug, Error)]
pub enum FatError {
    #[error("Block device initialization failed: {0}")]
    DeviceInitFailed(String),

    #[error("Could not read boot sector: {0}")]
    BootSectorReadFailed(String),

    #[error("Invalid boot sector: {0}")]
    InvalidBootSector(String),

    #[error("Device I/O error: {0}")]
    DeviceIoError(#[from] std::io::Error),

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    #[error("Filename too long: {0}")]
    FilenameTooLong(String),

    #[error("No free clusters left on volume")]
    DiskFull,

    #[error("Cluster chain corrupted: {0}")]
    ChainCorrupted(String),

    #[error("Mount point already in use: {0}")]
    MountPointInUse(String),

    #[error("Not mounted: {0}")]
    NotMounted(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Volume is mounted read-only")]
    ReadOnly,

    #[error("Directory is full: {0}")]
    DirectoryFull(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl FatError {
    /// Shorthand for device errors that did not originate from `std::io`.
    pub fn io(msg: impl Into<String>) -> Self {
        FatError::DeviceIoError(std::io::Error::new(std::io::ErrorKind::Other, msg.into()))
    }
}

pub type FatResult<T> = Result<T, FatError>;
