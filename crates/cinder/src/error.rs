use std::io;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{bencode::MalformedEncoding, tracker::TrackerFailure};

impl From<bendy::decoding::Error> for Error {
    fn from(value: bendy::decoding::Error) -> Self {
        Self::BencodeError(value.to_string())
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(value: bendy::encoding::Error) -> Self {
        Self::BencodeError(value.to_string())
    }
}

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_value: mpsc::error::SendError<T>) -> Self {
        Self::SendError
    }
}

impl From<toml::ser::Error> for Error {
    fn from(value: toml::ser::Error) -> Self {
        Self::ConfigError(value.to_string())
    }
}

impl From<speedy::Error> for Error {
    fn from(value: speedy::Error) -> Self {
        Self::SpeedyError(value.to_string())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),

    #[error("Failed to decode or encode the bencode buffer: {0}")]
    BencodeError(String),

    #[error("{0}")]
    Bencode(#[from] MalformedEncoding),

    #[error("Failed to decode or encode a tracker datagram: {0}")]
    SpeedyError(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerFailure),

    #[error("The metainfo file is invalid: {0}")]
    MetaInfoInvalid(&'static str),

    #[error("Refusing unsafe file name `{0}`")]
    UnsafeFileName(String),

    #[error("The info hash must be 20 bytes, or 40 hex characters")]
    InfoHashInvalid,

    #[error("The bitfield has the wrong length or set spare bits")]
    BitfieldInvalid,

    #[error("Invalid address `{0}`")]
    InvalidAddress(String),

    #[error("Can't parse compact ip list because it's not divisible by the ip version")]
    CompactPeerList,

    #[error("Encrypted handshake failed: {0}")]
    CryptoHandshake(&'static str),

    #[error("The peer sent a plaintext handshake but encryption is required")]
    PlaintextRefused,

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The peer closed the socket")]
    PeerClosedSocket,

    #[error("Message of {0} bytes exceeds the maximum length")]
    MessageTooLarge(usize),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("Already connected to this peer")]
    DuplicatePeer,

    #[error("Operation timed out")]
    Timeout,

    #[error(
        "Could not open the file `{0}`. Please make sure the program has \
         permission to access it"
    )]
    FileOpenError(String),

    #[error("The file `{0}` is locked by another process")]
    FileLocked(String),

    #[error("The resume record is malformed")]
    ResumeInvalid,

    #[error("Storage failed, the torrent was halted: {0}")]
    StorageHalted(String),

    #[error("{0} pieces failed the hash check")]
    IntegrityFailure(usize),

    #[error("Could not find torrent for the given info_hash")]
    TorrentDoesNotExist,

    #[error("You cannot add a duplicate torrent, only 1 is allowed")]
    NoDuplicateTorrent,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Configuration error: {0}")]
    FromConfigError(#[from] config::ConfigError),

    #[error("Could not find the home directory of the user")]
    HomeInvalid,

    #[error("Could not send message to the actor")]
    SendError,

    #[error("Could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),

    #[error("Task failed to join: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("More than {0} tasks failed, giving up")]
    TooManyTaskErrors(usize),

    #[error("Unsupported tracker URL `{0}`")]
    TrackerUrlInvalid(String),

    #[error("A lock was poisoned by a panicking task")]
    PoisonedLock,
}

/// Coarse classes of [`Error`], used to decide between local recovery and
/// surfacing, and to pick the exit code of the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad bytes from a remote; drop the connection or the block.
    Malformed,
    /// The network failed; retry later.
    Transient,
    /// Disk or file descriptor failure; the torrent halts.
    Resource,
    /// Bad user input; the component refuses to run.
    Configuration,
    /// Data on disk does not match the metainfo.
    Integrity,
    Fatal,
}

impl ErrorKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Configuration => 2,
            ErrorKind::Resource => 3,
            ErrorKind::Transient => 4,
            ErrorKind::Integrity => 5,
            ErrorKind::Malformed | ErrorKind::Fatal => 3,
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            BencodeError(_) | Bencode(_) | SpeedyError(_) | BitfieldInvalid | CompactPeerList
            | CryptoHandshake(_) | PlaintextRefused | HandshakeInvalid | MessageTooLarge(_)
            | ProtocolViolation(_) | DuplicatePeer | ResumeInvalid | InfoHashInvalid => {
                ErrorKind::Malformed
            }
            IO(e) => match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ErrorKind::Resource,
                io::ErrorKind::StorageFull | io::ErrorKind::ReadOnlyFilesystem => {
                    ErrorKind::Resource
                }
                _ => ErrorKind::Transient,
            },
            Http(_) | Tracker(_) | PeerClosedSocket | Timeout => ErrorKind::Transient,
            FileOpenError(_) | FileLocked(_) | StorageHalted(_) => ErrorKind::Resource,
            IntegrityFailure(_) => ErrorKind::Integrity,
            MetaInfoInvalid(_) | UnsafeFileName(_) | InvalidAddress(_) | ConfigError(_)
            | FromConfigError(_) | HomeInvalid | NoDuplicateTorrent | TorrentDoesNotExist
            | TrackerUrlInvalid(_) => {
                ErrorKind::Configuration
            }
            SendError | ReceiveErrorOneshot(_) | JoinError(_) | TooManyTaskErrors(_)
            | PoisonedLock => {
                ErrorKind::Fatal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(Error::ConfigError("x".into()).kind().exit_code(), 2);
        assert_eq!(Error::FileOpenError("x".into()).kind().exit_code(), 3);
        assert_eq!(Error::Timeout.kind().exit_code(), 4);
        assert_eq!(Error::IntegrityFailure(1).kind().exit_code(), 5);
        assert_eq!(Error::HandshakeInvalid.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn io_errors_split_by_cause() {
        let refused = Error::IO(io::ErrorKind::ConnectionRefused.into());
        assert_eq!(refused.kind(), ErrorKind::Transient);
        let missing = Error::IO(io::ErrorKind::NotFound.into());
        assert_eq!(missing.kind(), ErrorKind::Resource);
    }
}
