use thiserror::Error;

/// Storage-stack error codes.
///
/// Variants carry the semantic names of the kernel error families rather
/// than raw errno values; callers match on the variant, not on an integer.
#[derive(Error, Debug)]
pub enum VfsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("object is being torn down: {0}")]
    ObjectReleased(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("no such device: {0}")]
    NoDevice(String),

    #[error("no space left: {0}")]
    NoSpace(String),

    #[error("argument list too big: {0}")]
    TooBig(String),

    #[error("no such process or thread: {0}")]
    NoProcess(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("interrupted: {0}")]
    Interrupted(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("too many levels of links: {0}")]
    TooManyLinks(String),

    #[error("bad file descriptor: {0}")]
    BadDescriptor(String),

    #[error("too many open files: {0}")]
    TooManyFiles(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("IO error: {0}")]
    StdIo(#[from] std::io::Error),
}

impl VfsError {
    /// True for the lifecycle-collision family: the target was found but is
    /// in teardown, so the caller should treat the lookup as a miss.
    pub fn is_released(&self) -> bool {
        matches!(self, VfsError::ObjectReleased(_))
    }

    /// True when a wait was cut short by an asynchronous event.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, VfsError::Interrupted(_))
    }
}

impl Clone for VfsError {
    fn clone(&self) -> Self {
        match self {
            VfsError::InvalidArgument(s) => VfsError::InvalidArgument(s.clone()),
            VfsError::NotFound(s) => VfsError::NotFound(s.clone()),
            VfsError::ObjectReleased(s) => VfsError::ObjectReleased(s.clone()),
            VfsError::Busy(s) => VfsError::Busy(s.clone()),
            VfsError::AlreadyExists(s) => VfsError::AlreadyExists(s.clone()),
            VfsError::OutOfMemory(s) => VfsError::OutOfMemory(s.clone()),
            VfsError::NoDevice(s) => VfsError::NoDevice(s.clone()),
            VfsError::NoSpace(s) => VfsError::NoSpace(s.clone()),
            VfsError::TooBig(s) => VfsError::TooBig(s.clone()),
            VfsError::NoProcess(s) => VfsError::NoProcess(s.clone()),
            VfsError::PermissionDenied(s) => VfsError::PermissionDenied(s.clone()),
            VfsError::NotADirectory(s) => VfsError::NotADirectory(s.clone()),
            VfsError::IsADirectory(s) => VfsError::IsADirectory(s.clone()),
            VfsError::Io(s) => VfsError::Io(s.clone()),
            VfsError::Interrupted(s) => VfsError::Interrupted(s.clone()),
            VfsError::OutOfRange(s) => VfsError::OutOfRange(s.clone()),
            VfsError::TooManyLinks(s) => VfsError::TooManyLinks(s.clone()),
            VfsError::BadDescriptor(s) => VfsError::BadDescriptor(s.clone()),
            VfsError::TooManyFiles(s) => VfsError::TooManyFiles(s.clone()),
            VfsError::NotSupported(s) => VfsError::NotSupported(s.clone()),
            VfsError::StdIo(e) => VfsError::Io(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, VfsError>;
