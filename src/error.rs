use thiserror::Error;

#[derive(Error, Debug)]
pub enum NeoError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of GPU Memory")]
    OutOfMemory,

    #[error("Out of GPU virtual address space")]
    OutOfVirtualAddressSpace,

    #[error("Invalid allocation size: {0}")]
    InvalidSize(usize),

    #[error("Invalid allocation: {0}")]
    InvalidAllocation(String),

    #[error("Operation timed out")]
    WaitTimeout,

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid command queue: {0}")]
    InvalidQueue(String),

    #[error("Submission backend error: {0}")]
    Backend(String),

    /// Failure of a structure the command stream receiver cannot run without.
    /// Nothing below the queue layer retries after this.
    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),
}

// A convenient alias
pub type NeoResult<T> = Result<T, NeoError>;
