// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Error types shared across sessions, connections, and streams

/// Failures reported by a transport session.
///
/// Cloneable so that a single terminal error can be replayed to every caller
/// accepting on a [Connection](crate::Connection) after its multiplexer stops.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
  #[error("Connection closed by application: code {code}, reason {reason:?}")]
  ApplicationClosed { code: u64, reason: String },
  #[error("Connection closed by peer: {0}")]
  ConnectionClosed(String),
  #[error("Transport error encountered: {0}")]
  TransportError(String),
  #[error("Peer does not support any compatible version")]
  VersionMismatch,
  #[error("Connection reset by peer")]
  Reset,
  #[error("Connection timed out")]
  TimedOut,
  #[error("Connection closed locally")]
  LocallyClosed,
  #[error("Datagrams are unsupported or disabled on this connection")]
  DatagramsUnsupported,
  #[error("Datagram exceeds the maximum size allowed by the peer")]
  DatagramTooLarge,
  #[error("Close code {0} does not fit in a QUIC variable-length integer")]
  InvalidCloseCode(u64),
}

impl SessionError {
  /// Returns `true` if the session ended because this side closed it.
  #[must_use]
  pub fn is_locally_closed(&self) -> bool {
    matches!(self, Self::LocallyClosed)
  }
}

impl From<quinn::ConnectionError> for SessionError {
  fn from(connection_error: quinn::ConnectionError) -> Self {
    match connection_error {
      quinn::ConnectionError::VersionMismatch => Self::VersionMismatch,
      quinn::ConnectionError::TransportError(e) => Self::TransportError(e.to_string()),
      quinn::ConnectionError::ConnectionClosed(close) => Self::ConnectionClosed(close.to_string()),
      quinn::ConnectionError::ApplicationClosed(close) => Self::ApplicationClosed {
        code: close.error_code.into_inner(),
        reason: String::from_utf8_lossy(&close.reason).into_owned(),
      },
      quinn::ConnectionError::Reset => Self::Reset,
      quinn::ConnectionError::TimedOut => Self::TimedOut,
      quinn::ConnectionError::LocallyClosed => Self::LocallyClosed,
      #[allow(unreachable_patterns)]
      other => Self::TransportError(other.to_string()),
    }
  }
}

impl From<quinn::SendDatagramError> for SessionError {
  fn from(send_error: quinn::SendDatagramError) -> Self {
    match send_error {
      quinn::SendDatagramError::UnsupportedByPeer | quinn::SendDatagramError::Disabled => {
        Self::DatagramsUnsupported
      }
      quinn::SendDatagramError::TooLarge => Self::DatagramTooLarge,
      quinn::SendDatagramError::ConnectionLost(e) => e.into(),
    }
  }
}

/// Failures local to a single [DirectionalStream](crate::DirectionalStream)
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
  /// A receive operation was attempted on a stream without a receive half
  #[error("write-only stream")]
  WriteOnly,
  /// A send operation was attempted on a stream without a send half
  #[error("read-only stream")]
  ReadOnly,
  #[error("Stream deadline exceeded")]
  DeadlineExceeded,
  #[error("Stream I/O failed: {0}")]
  Io(#[source] std::io::Error),
}

impl StreamError {
  pub(crate) fn into_io(self) -> std::io::Error {
    match self {
      Self::Io(e) => e,
      Self::DeadlineExceeded => {
        std::io::Error::new(std::io::ErrorKind::TimedOut, Self::DeadlineExceeded)
      }
      capability => std::io::Error::new(std::io::ErrorKind::Unsupported, capability),
    }
  }
}

impl From<std::io::Error> for StreamError {
  /// Recovers capability and deadline failures that passed through the
  /// `AsyncRead`/`AsyncWrite` surface as wrapped I/O errors.
  fn from(e: std::io::Error) -> Self {
    let is_stream_error = e
      .get_ref()
      .map(|inner| inner.is::<StreamError>())
      .unwrap_or(false);
    if is_stream_error {
      match e.into_inner().map(|inner| inner.downcast::<StreamError>()) {
        Some(Ok(stream_error)) => *stream_error,
        // Unreachable by the check above, but fall back to an opaque I/O error
        Some(Err(inner)) => Self::Io(std::io::Error::new(std::io::ErrorKind::Other, inner)),
        None => Self::Io(std::io::ErrorKind::Other.into()),
      }
    } else {
      Self::Io(e)
    }
  }
}

/// Failures while waiting for the next peer-initiated stream
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AcceptError {
  #[error("Accept was cancelled by the caller")]
  Cancelled,
  #[error("Inbound streams terminated: {0}")]
  Terminated(#[source] SessionError),
  #[error("Inbound streams terminated without a recorded error")]
  Closed,
}

impl AcceptError {
  /// The transport failure that ended inbound stream delivery, if any.
  pub fn session_error(&self) -> Option<&SessionError> {
    match self {
      Self::Terminated(e) => Some(e),
      _ => None,
    }
  }
}

/// Failures building dial or listen configurations
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("No protocol specified; set a protocol or ALPN protocols on the TLS configuration")]
  NoProtocol,
  #[error("TLS configuration rejected: {0}")]
  Tls(#[from] rustls::Error),
  #[error("Failed reading credentials: {0}")]
  Io(#[from] std::io::Error),
  #[error("Invalid PEM content: {0}")]
  Pem(String),
  #[error("Invalid transport setting: {0}")]
  InvalidTransport(String),
}

/// Failures produced by a [Listener](crate::Listener)
#[derive(thiserror::Error, Debug)]
pub enum ListenError {
  #[error("Listener closed")]
  Closed,
  #[error("Accept was cancelled by the caller")]
  Cancelled,
  #[error("Listener configuration invalid: {0}")]
  Config(#[from] ConfigError),
  #[error("Listener socket failure: {0}")]
  Io(#[from] std::io::Error),
}

/// Failures produced while dialing a peer
#[derive(thiserror::Error, Debug)]
pub enum DialError {
  #[error("Dialer configuration invalid: {0}")]
  Config(#[from] ConfigError),
  #[error("Dialer socket failure: {0}")]
  Io(#[from] std::io::Error),
  #[error("Failed resolving {0}")]
  Resolve(String),
  #[error("Connection could not be initiated: {0}")]
  Connect(#[from] quinn::ConnectError),
  #[error("Handshake failed: {0}")]
  Handshake(#[source] SessionError),
}

#[cfg(test)]
mod tests {
  use super::{SessionError, StreamError};

  #[test]
  fn stream_errors_survive_io_wrapping() {
    let wrapped = StreamError::WriteOnly.into_io();
    assert_eq!(wrapped.kind(), std::io::ErrorKind::Unsupported);
    assert!(matches!(StreamError::from(wrapped), StreamError::WriteOnly));

    let timed_out = StreamError::DeadlineExceeded.into_io();
    assert_eq!(timed_out.kind(), std::io::ErrorKind::TimedOut);
    assert!(matches!(
      StreamError::from(timed_out),
      StreamError::DeadlineExceeded
    ));

    let plain = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
    match StreamError::from(plain) {
      StreamError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
      other => panic!("Unexpected conversion: {:?}", other),
    }
  }

  #[test]
  fn capability_messages() {
    assert_eq!(StreamError::WriteOnly.to_string(), "write-only stream");
    assert_eq!(StreamError::ReadOnly.to_string(), "read-only stream");
  }

  #[test]
  fn quinn_application_close_maps_code_and_reason() {
    let close = quinn::ApplicationClose {
      error_code: quinn::VarInt::from_u32(7),
      reason: bytes::Bytes::from_static(b"bye"),
    };
    let mapped: SessionError = quinn::ConnectionError::ApplicationClosed(close).into();
    assert_eq!(
      mapped,
      SessionError::ApplicationClosed {
        code: 7,
        reason: "bye".into()
      }
    );
    let local: SessionError = quinn::ConnectionError::LocallyClosed.into();
    assert!(local.is_locally_closed());
  }
}
