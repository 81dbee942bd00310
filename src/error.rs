use crate::driver::NativeError;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of every failure the runtime can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No platform or device is available.
    Enumeration,
    /// A context or queue could not be constructed.
    ContextCreation,
    /// A kernel failed to build on at least one device.
    Compile,
    /// A kernel argument could not be bound, or was never bound.
    ArgumentBinding,
    /// A buffer or image region is out of range.
    Bounds,
    /// A kernel submission failed.
    Dispatch,
    /// An internal invariant was found broken.
    Invariant,
    /// Anything else: bad handles, configuration, I/O, unsupported runtime.
    Usage,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no usable compute device: {0}")]
    Enumeration(String),

    #[error("context creation failed on platform {platform}: {source}")]
    ContextCreation {
        platform: String,
        #[source]
        source: NativeError,
    },

    #[error("kernel '{kernel}' failed to build for {device}: {status}")]
    Compile {
        kernel: String,
        device: String,
        status: NativeError,
        log: String,
    },

    #[error("kernel '{kernel}': cannot bind argument #{index} ({size} bytes): {reason}")]
    ArgumentBinding {
        kernel: String,
        index: u32,
        size: usize,
        reason: String,
    },

    #[error("kernel '{kernel}': argument #{index} was never bound")]
    MissingArgument { kernel: String, index: u32 },

    #[error("{what}: {axis} out of bounds ({value} > {limit})")]
    OutOfBounds {
        what: String,
        axis: &'static str,
        value: usize,
        limit: usize,
    },

    #[error("dispatch of kernel '{kernel}' failed: {source}")]
    Dispatch {
        kernel: String,
        #[source]
        source: NativeError,
    },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("compute runtime is unsupported on this system")]
    Unsupported,

    #[error("invalid or stale {0} handle")]
    InvalidHandle(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{op} failed: {source}")]
    Native {
        op: &'static str,
        #[source]
        source: NativeError,
    },

    #[error("not implemented: {0}")]
    Unimplemented(&'static str),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn invariant<S: Into<String>>(msg: S) -> Self {
        Error::Invariant(msg.into())
    }

    pub fn native(op: &'static str, source: NativeError) -> Self {
        Error::Native { op, source }
    }

    pub fn out_of_bounds<S: Into<String>>(
        what: S,
        axis: &'static str,
        value: usize,
        limit: usize,
    ) -> Self {
        Error::OutOfBounds {
            what: what.into(),
            axis,
            value,
            limit,
        }
    }

    /// Which part of the taxonomy this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Enumeration(_) => ErrorKind::Enumeration,
            Error::ContextCreation { .. } => ErrorKind::ContextCreation,
            Error::Compile { .. } => ErrorKind::Compile,
            Error::ArgumentBinding { .. } | Error::MissingArgument { .. } => {
                ErrorKind::ArgumentBinding
            }
            Error::OutOfBounds { .. } => ErrorKind::Bounds,
            Error::Dispatch { .. } => ErrorKind::Dispatch,
            Error::Invariant(_) => ErrorKind::Invariant,
            Error::Unsupported
            | Error::InvalidHandle(_)
            | Error::InvalidArgument(_)
            | Error::Native { .. }
            | Error::Unimplemented(_)
            | Error::Config(_)
            | Error::Io(_) => ErrorKind::Usage,
        }
    }

    /// The native status behind this error, when there is one.
    pub fn native_status(&self) -> Option<&NativeError> {
        match self {
            Error::ContextCreation { source, .. }
            | Error::Dispatch { source, .. }
            | Error::Native { source, .. } => Some(source),
            Error::Compile { status, .. } => Some(status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Status;

    #[test]
    fn test_native_display_carries_both_codes() {
        let err = Error::native(
            "enqueue_write",
            NativeError::new(Status::INVALID_VALUE, "offset past end"),
        );
        let msg = err.to_string();
        assert!(msg.contains("CL_INVALID_VALUE"));
        assert!(msg.contains("-30"));
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn test_kind_mapping() {
        let err = Error::MissingArgument {
            kernel: "k".into(),
            index: 1,
        };
        assert_eq!(err.kind(), ErrorKind::ArgumentBinding);
        assert!(err.to_string().contains("#1"));

        let err = Error::out_of_bounds("image", "x", 12, 8);
        assert_eq!(err.kind(), ErrorKind::Bounds);
        assert!(err.native_status().is_none());
    }
}
