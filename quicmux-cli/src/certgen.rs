// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::path::{Path, PathBuf};
use tracing::instrument;

/// Paths of the certificate and private key written for `output_base_path`
pub fn output_paths(output_base_path: &Path) -> Result<(PathBuf, PathBuf)> {
  let file_name = output_base_path
    .file_name()
    .and_then(|name| name.to_str())
    .context("Output path must end in a UTF-8 file name")?;
  Ok((
    output_base_path.with_file_name(format!("{}.pub.pem", file_name)),
    output_base_path.with_file_name(format!("{}.priv.pem", file_name)),
  ))
}

#[instrument]
pub async fn certgen_main(output_base_path: String, host_san: String) -> Result<()> {
  use std::fs;
  let path = PathBuf::from(output_base_path);
  let (public_path, private_path) = output_paths(&path)?;
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).context("Directory creation must succeed for certs")?;
  }
  let cert =
    rcgen::generate_simple_self_signed(vec![host_san]).context("Certificate generation failed")?;
  let public_pem = cert.serialize_pem()?;
  let private_pem = cert.serialize_private_key_pem();
  fs::write(&public_path, &public_pem).context("Failed writing public key")?;
  fs::write(&private_path, &private_pem).context("Failed writing private key")?;
  tracing::info!(certificate = ?public_path, key = ?private_path, "Wrote self-signed certificate");
  Ok(())
}
