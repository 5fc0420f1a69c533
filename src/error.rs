use thiserror::Error;

pub type Result<T = ()> = core::result::Result<T, SfvmkError>;

/// Errors raised by the driver core.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SfvmkError {
    #[error("out of memory")]
    NoMemory,
    #[error("DMA mapping failed")]
    DmaMapFailed,
    #[error("object is in the wrong state for this operation")]
    InvalidState,
    #[error("bad parameter")]
    BadParam,
    #[error("descriptor count {0} is not a power of two")]
    NotPowerOfTwo(u32),
    #[error("no space left")]
    NoSpace,
    #[error("operation timed out")]
    Timeout,
    #[error("resource busy")]
    Busy,
    #[error("transmit queue is full")]
    QueueFull,
    #[error("not found")]
    NotFound,
    #[error("not supported")]
    NotSupported,
    #[error("I/O error")]
    IoError,
    #[error("MC rejected the command with errno {0}")]
    McdiFailed(u32),
    #[error("MC rebooted while a command was outstanding")]
    McReboot,
    #[error("request aborted")]
    Aborted,
}

/// Status codes reported across the management channel.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    Failure = 1,
    NoMemory = 2,
    BadParam = 3,
    NotFound = 4,
    NoSpace = 5,
    NotSupported = 6,
    Timeout = 7,
    Busy = 8,
    IoError = 9,
    NotReady = 10,
    Aborted = 11,
}

impl SfvmkError {
    pub fn status(&self) -> Status {
        match self {
            SfvmkError::NoMemory | SfvmkError::DmaMapFailed => Status::NoMemory,
            SfvmkError::InvalidState => Status::NotReady,
            SfvmkError::BadParam | SfvmkError::NotPowerOfTwo(_) => Status::BadParam,
            SfvmkError::NoSpace => Status::NoSpace,
            SfvmkError::Timeout => Status::Timeout,
            SfvmkError::Busy | SfvmkError::QueueFull => Status::Busy,
            SfvmkError::NotFound => Status::NotFound,
            SfvmkError::NotSupported => Status::NotSupported,
            SfvmkError::IoError | SfvmkError::McReboot => Status::IoError,
            SfvmkError::McdiFailed(_) => Status::Failure,
            SfvmkError::Aborted => Status::Aborted,
        }
    }
}

impl From<SfvmkError> for Status {
    fn from(err: SfvmkError) -> Status {
        err.status()
    }
}
