//! Error types for StreamTap
//!
//! This module defines the main error type used throughout StreamTap and the
//! mapping from Kafka protocol error codes to library errors, so that broker
//! responses surface to callers with their original meaning intact.

use thiserror::Error;

/// Result type alias for StreamTap operations
pub type Result<T> = std::result::Result<T, TapError>;

/// Kafka protocol error codes relevant to partition consumption
/// See: <https://kafka.apache.org/protocol.html#protocol_error_codes>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum KafkaErrorCode {
    /// No error
    None = 0,
    /// Unknown server error
    UnknownServerError = -1,
    /// The requested offset is outside the range of offsets
    OffsetOutOfRange = 1,
    /// Message failed its CRC check or is otherwise corrupt
    CorruptMessage = 2,
    /// Unknown topic or partition
    UnknownTopicOrPartition = 3,
    /// Invalid message size
    InvalidMessageSize = 4,
    /// There is no leader for this topic-partition
    LeaderNotAvailable = 5,
    /// This broker is not the leader for that topic-partition
    NotLeaderOrFollower = 6,
    /// Request timed out
    RequestTimedOut = 7,
    /// Broker not available
    BrokerNotAvailable = 8,
    /// Replica not available
    ReplicaNotAvailable = 9,
    /// Message too large
    MessageTooLarge = 10,
    /// Network exception while the request was in flight
    NetworkException = 13,
    /// Invalid topic
    InvalidTopicException = 17,
    /// Not enough in-sync replicas
    NotEnoughReplicas = 19,
    /// Unsupported version
    UnsupportedVersion = 35,
    /// Invalid request
    InvalidRequest = 42,
    /// Kafka storage error on the broker
    KafkaStorageError = 56,
    /// Fetch session id not found
    FetchSessionIdNotFound = 70,
    /// Invalid fetch session epoch
    InvalidFetchSessionEpoch = 71,
    /// Fenced leader epoch
    FencedLeaderEpoch = 74,
    /// Unknown leader epoch
    UnknownLeaderEpoch = 75,
    /// Offset not available while the partition is catching up
    OffsetNotAvailable = 78,
    /// Preferred leader not available
    PreferredLeaderNotAvailable = 80,
}

impl KafkaErrorCode {
    /// Map a raw wire error code to the closest known variant.
    ///
    /// Codes this library has no dedicated handling for collapse into
    /// `UnknownServerError`; they are still reported to the caller verbatim
    /// through [`TapError::Kafka`].
    pub fn from_code(code: i16) -> Self {
        match code {
            0 => KafkaErrorCode::None,
            1 => KafkaErrorCode::OffsetOutOfRange,
            2 => KafkaErrorCode::CorruptMessage,
            3 => KafkaErrorCode::UnknownTopicOrPartition,
            4 => KafkaErrorCode::InvalidMessageSize,
            5 => KafkaErrorCode::LeaderNotAvailable,
            6 => KafkaErrorCode::NotLeaderOrFollower,
            7 => KafkaErrorCode::RequestTimedOut,
            8 => KafkaErrorCode::BrokerNotAvailable,
            9 => KafkaErrorCode::ReplicaNotAvailable,
            10 => KafkaErrorCode::MessageTooLarge,
            13 => KafkaErrorCode::NetworkException,
            17 => KafkaErrorCode::InvalidTopicException,
            19 => KafkaErrorCode::NotEnoughReplicas,
            35 => KafkaErrorCode::UnsupportedVersion,
            42 => KafkaErrorCode::InvalidRequest,
            56 => KafkaErrorCode::KafkaStorageError,
            70 => KafkaErrorCode::FetchSessionIdNotFound,
            71 => KafkaErrorCode::InvalidFetchSessionEpoch,
            74 => KafkaErrorCode::FencedLeaderEpoch,
            75 => KafkaErrorCode::UnknownLeaderEpoch,
            78 => KafkaErrorCode::OffsetNotAvailable,
            80 => KafkaErrorCode::PreferredLeaderNotAvailable,
            _ => KafkaErrorCode::UnknownServerError,
        }
    }

    /// Returns true if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            KafkaErrorCode::CorruptMessage
                | KafkaErrorCode::UnknownTopicOrPartition
                | KafkaErrorCode::LeaderNotAvailable
                | KafkaErrorCode::NotLeaderOrFollower
                | KafkaErrorCode::RequestTimedOut
                | KafkaErrorCode::BrokerNotAvailable
                | KafkaErrorCode::ReplicaNotAvailable
                | KafkaErrorCode::NetworkException
                | KafkaErrorCode::NotEnoughReplicas
                | KafkaErrorCode::KafkaStorageError
                | KafkaErrorCode::FetchSessionIdNotFound
                | KafkaErrorCode::FencedLeaderEpoch
                | KafkaErrorCode::UnknownLeaderEpoch
                | KafkaErrorCode::OffsetNotAvailable
                | KafkaErrorCode::PreferredLeaderNotAvailable
        )
    }

    /// Convert to the i16 error code used in the Kafka protocol
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }
}

impl std::fmt::Display for KafkaErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.as_i16())
    }
}

/// Main error type for StreamTap.
///
/// `TapError` is `Clone` because a single transport failure on a broker
/// connection fans out to every partition subscribed on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TapError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("The requested offset is outside the range of offsets maintained by the broker for the given topic/partition")]
    OffsetOutOfRange,

    #[error("This request is for a topic or partition that does not exist on this broker")]
    UnknownTopicOrPartition,

    #[error("This broker is not the leader for that topic/partition")]
    NotLeaderForPartition,

    #[error("There is no currently elected leader for that topic/partition")]
    LeaderNotAvailable,

    #[error("Message was larger than the configured maximum fetch size")]
    MessageTooLarge,

    #[error("The broker response did not contain all the expected topic/partition blocks")]
    IncompleteResponse,

    #[error("Kafka error: {0}")]
    Kafka(KafkaErrorCode),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("The consumer is shutting down")]
    ShuttingDown,
}

impl TapError {
    /// Create a configuration error with context
    pub fn config(reason: impl Into<String>) -> Self {
        TapError::Configuration(reason.into())
    }

    /// Create a transport error with context
    pub fn transport(detail: impl Into<String>) -> Self {
        TapError::Transport(detail.into())
    }

    /// Create a metadata error with context
    pub fn metadata(detail: impl Into<String>) -> Self {
        TapError::Metadata(detail.into())
    }

    /// Translate a broker-reported error code into the library error that
    /// callers observe. Codes with no dedicated variant are carried verbatim.
    pub fn from_kafka_code(code: KafkaErrorCode) -> Self {
        match code {
            KafkaErrorCode::OffsetOutOfRange => TapError::OffsetOutOfRange,
            KafkaErrorCode::UnknownTopicOrPartition => TapError::UnknownTopicOrPartition,
            KafkaErrorCode::NotLeaderOrFollower => TapError::NotLeaderForPartition,
            KafkaErrorCode::LeaderNotAvailable => TapError::LeaderNotAvailable,
            KafkaErrorCode::MessageTooLarge => TapError::MessageTooLarge,
            other => TapError::Kafka(other),
        }
    }
}

impl From<std::io::Error> for TapError {
    fn from(e: std::io::Error) -> Self {
        TapError::Transport(e.to_string())
    }
}
