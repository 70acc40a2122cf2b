use thiserror::Error;

#[derive(Error, Debug)]
pub enum UsmError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Native Driver Error: {0}")]
    Driver(String),

    #[error("Out of device memory")]
    OutOfDeviceMemory,

    #[error("Out of host memory")]
    OutOfHostMemory,

    #[error("Unsupported alignment")]
    UnsupportedAlignment,

    #[error("Invalid value")]
    InvalidValue,

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Invalid USM allocation size")]
    InvalidUsmSize,

    /// The pointer is not owned by any pool of the context.
    #[error("Invalid memory object: 0x{0:x}")]
    InvalidMemObject(usize),

    #[error("Invalid context")]
    InvalidContext,

    #[error("Invalid device")]
    InvalidDevice,

    #[error("A pool is already registered for this descriptor")]
    PoolAlreadyRegistered,

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    #[error("Unsupported enumeration value: {0}")]
    UnsupportedEnumeration(u32),

    /// The native runtime has already been torn down.
    #[error("Native runtime is uninitialized")]
    Uninitialized,

    #[error("Attempting to free 0x{addr:x} which was not allocated")]
    BadFree { addr: usize },

    #[error("Attempting to free 0x{addr:x} which was already freed")]
    DoubleFree { addr: usize },
}

impl UsmError {
    /// `true` for either flavour of resource exhaustion.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfDeviceMemory | Self::OutOfHostMemory)
    }
}

// A convenient alias
pub type UsmResult<T> = Result<T, UsmError>;
