// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use quicmux::{config::load_certificate_chain, Dialer};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ClientArgs {
  pub authority_cert: Option<PathBuf>,
  pub server_addr: std::net::SocketAddr,
  pub server_san: String,
  pub protocol: String,
  pub message: String,
  pub unidirectional: bool,
}

fn build_dialer(config: &ClientArgs) -> Result<Dialer> {
  let mut dialer = Dialer::new(config.protocol.clone());
  if let Some(authority_cert_path) = &config.authority_cert {
    let authority =
      load_certificate_chain(authority_cert_path).context("Failed reading authority cert file")?;
    let mut roots = rustls::RootCertStore::empty();
    let (_added, ignored) =
      roots.add_parsable_certificates(&authority.into_iter().map(|c| c.0).collect::<Vec<_>>());
    if ignored > 0 {
      anyhow::bail!("{} authority certificates could not be parsed", ignored);
    }
    dialer.tls_config = Some(
      rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth(),
    );
  }
  Ok(dialer)
}

#[tracing::instrument(skip(config), fields(server = %config.server_addr), err)]
pub async fn client_main(config: ClientArgs) -> Result<()> {
  let dialer = build_dialer(&config)?;
  let connection = dialer
    .dial(config.server_addr, &config.server_san)
    .await
    .context("Failed connecting to server")?;

  let mut stream = connection
    .open_stream(config.unidirectional)
    .await
    .context("Failed opening stream")?;
  stream.write_all(config.message.as_bytes()).await?;
  stream.close().await?;

  if stream.can_receive() {
    let mut echo = Vec::new();
    stream
      .read_to_end(&mut echo)
      .await
      .context("Failed reading echo")?;
    println!("{}", String::from_utf8_lossy(&echo));
  }

  connection.close()?;
  Ok(())
}
