// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

use validators::{parse_socketaddr, validate_existing_file, validate_protocol, validate_socketaddr};

mod certgen;
mod client;
mod server;
mod validators;

/// ALPN protocol spoken by the echo server and client
pub const DEFAULT_PROTOCOL: &str = "quicmux-echo";

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quinn=warn,quinn_proto=warn,debug"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let protocol_arg = Arg::new("protocol")
    .help("ALPN protocol identifier to negotiate")
    .long("protocol")
    .short('p')
    .validator(validate_protocol)
    .default_value(DEFAULT_PROTOCOL)
    .takes_value(true);
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("client")
        .alias("-c")
        .about("Send a message to an echo server over a new stream")
        .arg(
          Arg::new("authority")
            .help("Certificate to trust instead of the platform roots")
            .long("authority")
            .short('a')
            .validator(validate_existing_file)
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("server")
            .long("server")
            .short('s')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:4433")
            .takes_value(true),
        )
        .arg(
          Arg::new("server-san")
            .long("server-san")
            .visible_alias("san")
            .default_value("localhost")
            .takes_value(true),
        )
        .arg(protocol_arg.clone())
        .arg(
          Arg::new("message")
            .long("message")
            .short('m')
            .default_value("ping")
            .takes_value(true),
        )
        .arg(
          Arg::new("unidirectional")
            .help("Send without waiting for an echo")
            .long("unidirectional")
            .short('u')
            .takes_value(false),
        ),
    )
    .subcommand(
      Command::new("server")
        .alias("-s")
        .about("Echo bidirectional streams and log one-way messages from any number of clients")
        .arg(
          Arg::new("cert")
            .long("cert")
            .short('c')
            .validator(validate_existing_file)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("key")
            .long("key")
            .short('k')
            .validator(validate_existing_file)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("quic")
            .help("Address that will accept QUIC connections")
            .long("quic")
            .short('q')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:4433")
            .takes_value(true),
        )
        .arg(protocol_arg),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate self-signed certificates for local usage")
        .arg(Arg::new("path").takes_value(true).required(true))
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .required(false)
            .default_value("localhost"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

/// Fetches an argument that is either required or has a default value
fn argument<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
  args
    .value_of(name)
    .with_context(|| format!("Missing argument {}", name))
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  Ok(client::ClientArgs {
    authority_cert: args.value_of("authority").map(PathBuf::from),
    server_addr: parse_socketaddr(argument(args, "server")?)?,
    server_san: argument(args, "server-san")?.into(),
    protocol: argument(args, "protocol")?.into(),
    message: argument(args, "message")?.into(),
    unidirectional: args.is_present("unidirectional"),
  })
}

pub fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  Ok(server::ServerArgs {
    cert: PathBuf::from(argument(args, "cert")?),
    key: PathBuf::from(argument(args, "key")?),
    quinn_bind_addr: parse_socketaddr(argument(args, "quic")?)?,
    protocol: argument(args, "protocol")?.into(),
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("server", opts)) => {
      let config = server_arg_handling(opts)?;
      tracing::info!("Running as server with config {:#?}", config);
      server::server_main(config).await
    }
    Some(("client", opts)) => {
      let config = client_arg_handling(opts)?;
      tracing::info!("Running as client with config {:#?}", config);
      client::client_main(config).await
    }
    Some(("cert", opts)) => {
      tracing::info!("Generating certs...");
      let path = argument(opts, "path")?;
      let san = argument(opts, "san")?;
      certgen::certgen_main(path.into(), san.into()).await
    }
    _ => anyhow::bail!("A subcommand is required"),
  }
}
