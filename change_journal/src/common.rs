use change_journal_base::{SimpleVersion, TimeParseError};
use rkyv::ser::serializers::{
    AllocScratchError, CompositeSerializerError, SharedSerializeMapError,
};
use rkyv::validation::validators::DefaultValidatorError;
use rkyv::validation::CheckArchiveError;
use rkyv::AlignedVec;
use std::convert::Infallible;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Sled(#[from] sled::Error),

    #[error("journal at {location} cannot be opened: {source}")]
    Startup {
        location: String,
        #[source]
        source: sled::Error,
    },

    #[error("commit failed after {attempts} attempts: {source}")]
    Commit {
        attempts: u32,
        #[source]
        source: sled::Error,
    },

    #[error("journal record format {found} cannot be read by {expected}")]
    FormatMismatch {
        found: SimpleVersion,
        expected: SimpleVersion,
    },

    #[error("config: {}", .0)]
    Config(String),

    #[error("cluster: {}", .0)]
    Cluster(String),

    #[error("{}", .0)]
    Internal(String),

    #[error("rkyv serialize: {}", .0)]
    RkyvSerializeError(String),

    #[error("rkyv check_archived_root failed: {}", .0)]
    RkyvDeserializeError(String),

    #[error("broadcast channel error")]
    PostageBroadcast,
}

impl From<CompositeSerializerError<Infallible, AllocScratchError, SharedSerializeMapError>>
    for Error
{
    fn from(
        value: CompositeSerializerError<Infallible, AllocScratchError, SharedSerializeMapError>,
    ) -> Self {
        Error::RkyvSerializeError(format!("{value:?}"))
    }
}

impl<T: Debug> From<CheckArchiveError<T, DefaultValidatorError>> for Error {
    fn from(value: CheckArchiveError<T, DefaultValidatorError>) -> Self {
        Error::RkyvDeserializeError(format!("{value:?}"))
    }
}

impl From<Infallible> for Error {
    fn from(_value: Infallible) -> Self {
        Error::RkyvDeserializeError("Infallible".into())
    }
}

impl From<ron::error::SpannedError> for Error {
    fn from(value: ron::error::SpannedError) -> Self {
        Error::Config(value.to_string())
    }
}

impl From<TimeParseError> for Error {
    fn from(value: TimeParseError) -> Self {
        Error::Config(value.to_string())
    }
}

/// Copies stored or received bytes into an aligned buffer, archived roots must be aligned
/// before they can be validated.
pub(crate) fn aligned(bytes: &[u8]) -> AlignedVec {
    let mut buf = AlignedVec::with_capacity(bytes.len());
    buf.extend_from_slice(bytes);
    buf
}
