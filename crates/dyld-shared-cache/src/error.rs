use std::{error, fmt};

/// An error from any phase of the cache-build pipeline.
#[derive(Debug)]
pub struct Error {
    inner: ErrorInner,
}

#[derive(Debug)]
enum ErrorInner {
    MalformedInput(String),
    Unsupported(String),
    Resolution(String),
    LayoutOverflow(String),
    AddressOutOfRange(u64),
    StateDivergence(String),
    View(macho_view::Error),
}

/// Error kind taxonomy, independent of message (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedInput,
    UnsupportedFeature,
    ResolutionFailure,
    LayoutOverflow,
    AddressOutOfRange,
    StateDivergence,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::MalformedInput(m) => write!(f, "malformed input: {m}"),
            ErrorInner::Unsupported(m) => write!(f, "unsupported feature: {m}"),
            ErrorInner::Resolution(m) => write!(f, "resolution failure: {m}"),
            ErrorInner::LayoutOverflow(m) => write!(f, "layout overflow: {m}"),
            ErrorInner::AddressOutOfRange(va) => write!(f, "address 0x{va:x} not covered by any segment"),
            ErrorInner::StateDivergence(m) => write!(f, "verify-mode state divergence: {m}"),
            ErrorInner::View(e) => write!(f, "{e}"),
        }
    }
}

impl error::Error for Error {}

impl From<macho_view::Error> for Error {
    fn from(e: macho_view::Error) -> Self {
        Error {
            inner: ErrorInner::View(e),
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::MalformedInput(_) => ErrorKind::MalformedInput,
            ErrorInner::Unsupported(_) => ErrorKind::UnsupportedFeature,
            ErrorInner::Resolution(_) => ErrorKind::ResolutionFailure,
            ErrorInner::LayoutOverflow(_) => ErrorKind::LayoutOverflow,
            ErrorInner::AddressOutOfRange(_) => ErrorKind::AddressOutOfRange,
            ErrorInner::StateDivergence(_) => ErrorKind::StateDivergence,
            ErrorInner::View(e) => match e.kind() {
                macho_view::ErrorKind::AddressOutOfRange => ErrorKind::AddressOutOfRange,
                macho_view::ErrorKind::UnsupportedFeature => ErrorKind::UnsupportedFeature,
                _ => ErrorKind::MalformedInput,
            },
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Error {
            inner: ErrorInner::MalformedInput(message.into()),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Error {
            inner: ErrorInner::Unsupported(message.into()),
        }
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        Error {
            inner: ErrorInner::Resolution(message.into()),
        }
    }

    pub fn layout_overflow(message: impl Into<String>) -> Self {
        Error {
            inner: ErrorInner::LayoutOverflow(message.into()),
        }
    }

    pub fn address_out_of_range(va: u64) -> Self {
        Error {
            inner: ErrorInner::AddressOutOfRange(va),
        }
    }

    pub fn state_divergence(message: impl Into<String>) -> Self {
        Error {
            inner: ErrorInner::StateDivergence(message.into()),
        }
    }
}

/// Whether a `Warning`-kind condition happened without aborting the build
/// (§7): missing weak-import dependents, matching-UUID install-name
/// collisions, per-dylib `sharable()` rejections.
#[derive(Debug, Clone)]
pub struct Warning(pub String);

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
