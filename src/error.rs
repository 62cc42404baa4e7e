//! Error types for store operations.

/// Result type alias for mirrorstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for mirrorstore operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// Bad, duplicate or ambiguous schema registration. Raised synchronously
  /// at registration time, never at use time.
  #[error("Schema configuration error: {0}")]
  Configuration(String),

  /// Programmer error, e.g. a null object id where one is required.
  #[error("Invalid state: {0}")]
  InvalidState(String),

  /// Malformed payload produced or consumed by the codec.
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Error from the embedded store.
  #[error("Storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  /// The store's write worker is gone; the store was dropped or its
  /// runtime shut down.
  #[error("Store worker unavailable: {0}")]
  Queue(String),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}
