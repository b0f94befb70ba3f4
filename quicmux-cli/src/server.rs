// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use quicmux::{
  config::{load_certificate_chain, load_private_key},
  AcceptError, Connection, DirectionalStream, ListenConfig, ListenError, StreamDirection,
};
use std::{path::PathBuf, time::Duration};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

/// Close code sent to clients when the server shuts down
const SHUTDOWN_CLOSE_CODE: u64 = 1;
/// How long to wait for connections to drain after shutdown is requested
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters used to run an echo server
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ServerArgs {
  pub cert: PathBuf,
  pub key: PathBuf,
  pub quinn_bind_addr: std::net::SocketAddr,
  pub protocol: String,
}

/// Run an echo server until interrupted
#[tracing::instrument(
skip(config),
fields(
quinn=?config.quinn_bind_addr,
protocol=%config.protocol,
),
err
)]
pub async fn server_main(config: self::ServerArgs) -> Result<()> {
  let certificate_chain = load_certificate_chain(&config.cert).context("Failed reading cert file")?;
  let private_key = load_private_key(&config.key).context("Failed reading private key file")?;
  let listener = ListenConfig::new(config.protocol.clone(), certificate_chain, private_key)
    .bind(config.quinn_bind_addr)
    .context("Failed binding QUIC listener")?;

  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };

  let result = loop {
    match listener.accept_with_cancellation(&shutdown).await {
      Ok(connection) => {
        let span = tracing::info_span!("client", id = %connection.id(), remote = %connection.remote_addr());
        tokio::task::spawn(serve_connection(connection, shutdown.child_token()).instrument(span));
      }
      Err(ListenError::Cancelled) => break Ok(()),
      Err(e) => break Err(anyhow::Error::new(e).context("Listener failed")),
    }
  };

  listener.close();
  // Connections observe the same shutdown token and close themselves
  shutdown.cancel();
  if tokio::time::timeout(DRAIN_TIMEOUT, listener.wait_idle())
    .await
    .is_err()
  {
    tracing::warn!("Connections did not drain before the shutdown deadline");
  }

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;

  result
}

async fn serve_connection(connection: Connection, shutdown: CancellationToken) {
  tracing::info!("Client connected");
  loop {
    let stream = match connection.accept_stream_with_cancellation(&shutdown).await {
      Ok(stream) => stream,
      Err(AcceptError::Cancelled) => {
        if let Err(error) = connection.close_with_error(SHUTDOWN_CLOSE_CODE, "server shutting down") {
          tracing::debug!(%error, "Close on shutdown failed");
        }
        break;
      }
      Err(error) => {
        tracing::info!(%error, "Client disconnected");
        break;
      }
    };
    let span = tracing::debug_span!("stream", direction = ?stream.direction());
    tokio::task::spawn(
      async move {
        if let Err(error) = handle_stream(stream).await {
          tracing::debug!(error = ?error, "Stream handler failed");
        }
      }
      .instrument(span),
    );
  }
}

async fn handle_stream(mut stream: DirectionalStream) -> Result<()> {
  match stream.direction() {
    StreamDirection::Bidirectional => {
      let (mut recv, mut send) = tokio::io::split(stream);
      let echoed = tokio::io::copy(&mut recv, &mut send)
        .await
        .context("Echo failed")?;
      send.shutdown().await.context("Closing echo stream failed")?;
      tracing::debug!(bytes = echoed, "Echoed stream");
    }
    StreamDirection::ReceiveOnly => {
      let mut content = Vec::new();
      stream
        .read_to_end(&mut content)
        .await
        .context("Reading one-way message failed")?;
      tracing::info!(content = %String::from_utf8_lossy(&content), "Received one-way message");
    }
    StreamDirection::SendOnly => {
      tracing::warn!("Ignoring send-only stream; peers cannot initiate those");
    }
  }
  Ok(())
}
