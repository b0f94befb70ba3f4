// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Connection-oriented streams over QUIC
//!
//! A [Connection] owns one transport session. Peer-initiated bidirectional
//! and receive-only streams are merged into a single accept queue, outbound
//! streams are opened on demand, and closing is idempotent across every
//! clone of the connection.

pub mod config;
pub mod connection;
pub mod dialer;
pub mod error;
pub mod listener;
mod multiplexer;
pub mod session;
pub mod stream;
pub mod util;

pub use self::{
  config::TransportSettings,
  connection::{
    Connection, ConnectionId, ConnectionState, DEFAULT_CLOSE_CODE, DEFAULT_CLOSE_MESSAGE,
  },
  dialer::{dial, Dialer},
  error::{AcceptError, ConfigError, DialError, ListenError, SessionError, StreamError},
  listener::{listen, ListenConfig, Listener},
  multiplexer::DELIVERY_QUEUE_DEPTH,
  session::{QuinnSession, Session},
  stream::{DirectionalStream, StreamDirection},
};
