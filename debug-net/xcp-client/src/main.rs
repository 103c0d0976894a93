// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Deserialize;
use xcp_net::{NetSettings, XcpNetTransport, XcpTransport};

/// XCP CONNECT in normal mode.
const CONNECT: [u8; 2] = [0xff, 0x00];
/// First byte of a positive response.
const PID_RES: u8 = 0xff;
/// First byte of an error packet.
const PID_ERR: u8 = 0xfe;

/// Port the bootloader's TCP/IP transport listens on out of the box.
const DEFAULT_PORT: u16 = 1000;

#[derive(Debug, Parser)]
#[clap(max_term_width = 80, about = "Talk to an XCP bootloader over TCP")]
struct Args {
    /// Settings file (TOML) with a `[net]` table
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Target host name or IP address; overrides the settings file
    #[clap(short, long)]
    address: Option<String>,
    /// Target TCP port; overrides the settings file
    #[clap(short, long)]
    port: Option<u16>,
    /// How long to wait for each response
    #[clap(long, default_value_t = 1000)]
    timeout_ms: u64,
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Send CONNECT and print the response
    Connect,
    /// Send raw command bytes (hex, e.g. `ff 00`) and print the response
    Send {
        #[clap(required = true, parse(try_from_str = parse_byte))]
        bytes: Vec<u8>,
    },
    /// Repeat CONNECT over one connection and report round-trip times
    Ping {
        #[clap(short = 'n', long, default_value_t = 4)]
        count: usize,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    net: NetSettings,
}

fn parse_byte(s: &str) -> Result<u8, ParseIntError> {
    u8::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16)
}

fn load_config(path: &Path) -> Result<NetSettings> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config = toml::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(config.net)
}

/// Builds the settings from the config file (if any) with command-line
/// overrides applied on top.
fn settings(
    file: Option<NetSettings>,
    address: Option<String>,
    port: Option<u16>,
) -> Result<NetSettings> {
    let mut settings = match (file, &address) {
        (Some(s), _) => s,
        (None, Some(a)) => NetSettings::new(a.clone(), DEFAULT_PORT),
        (None, None) => bail!("must provide --address or --config"),
    };
    if let Some(a) = address {
        settings.address = a;
    }
    if let Some(p) = port {
        settings.port = p;
    }
    Ok(settings)
}

#[derive(Debug, PartialEq)]
enum Response<'a> {
    Positive(&'a [u8]),
    Error { code: Option<u8> },
    Unknown(&'a [u8]),
}

impl<'a> Response<'a> {
    fn classify(rx: &'a [u8]) -> Self {
        match rx {
            [PID_RES, rest @ ..] => Response::Positive(rest),
            [PID_ERR, rest @ ..] => Response::Error {
                code: rest.first().copied(),
            },
            _ => Response::Unknown(rx),
        }
    }
}

fn report(rx: &[u8]) {
    match Response::classify(rx) {
        Response::Positive(data) => println!("ok {data:02x?}"),
        Response::Error { code: Some(code) } => {
            println!("error packet, code {code:#04x}")
        }
        Response::Error { code: None } => println!("error packet"),
        Response::Unknown(data) => {
            warn!("response doesn't start with a PID");
            println!("{data:02x?}");
        }
    }
}

fn ping(
    xcp: &mut impl XcpTransport,
    count: usize,
    timeout: Duration,
) -> Result<()> {
    let mut times = Vec::with_capacity(count);
    for i in 0..count {
        let start = Instant::now();
        let rx = xcp
            .send_packet(&CONNECT, timeout)
            .with_context(|| format!("CONNECT #{i}"))?;
        let elapsed = start.elapsed();
        info!("#{i}: {elapsed:?}");
        if !matches!(Response::classify(&rx), Response::Positive(_)) {
            report(&rx);
        }
        times.push(elapsed);
    }

    if let (Some(min), Some(max)) = (times.iter().min(), times.iter().max()) {
        let total: Duration = times.iter().sum();
        let avg = total / times.len() as u32;
        println!(
            "{} round trips: min {min:?}, avg {avg:?}, max {max:?}",
            times.len()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args = Args::parse();
    let file = args.config.as_deref().map(load_config).transpose()?;
    let settings = settings(file, args.address, args.port)?;
    let timeout = Duration::from_millis(args.timeout_ms);

    let mut xcp = XcpNetTransport::new(settings).context("bad settings")?;
    let NetSettings { address, port, .. } = xcp.settings();
    let target = format!("{address}:{port}");
    xcp.connect()
        .with_context(|| format!("connecting to {target}"))?;

    match args.cmd {
        Cmd::Connect => {
            let rx = xcp.send_packet(&CONNECT, timeout).context("CONNECT")?;
            report(&rx);
        }
        Cmd::Send { bytes } => {
            let rx = xcp.send_packet(&bytes, timeout)?;
            report(&rx);
        }
        Cmd::Ping { count } => ping(&mut xcp, count, timeout)?,
    }

    xcp.terminate();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_hex() {
        assert_eq!(parse_byte("ff").unwrap(), 0xff);
        assert_eq!(parse_byte("0x0A").unwrap(), 0x0a);
        assert!(parse_byte("100").is_err());
        assert!(parse_byte("zz").is_err());
    }

    #[test]
    fn classifies_responses() {
        assert_eq!(
            Response::classify(&[0xff, 0x10, 0x00]),
            Response::Positive(&[0x10, 0x00])
        );
        assert_eq!(
            Response::classify(&[0xfe, 0x20]),
            Response::Error { code: Some(0x20) }
        );
        assert_eq!(Response::classify(&[0xfe]), Response::Error { code: None });
        assert_eq!(Response::classify(&[0x01]), Response::Unknown(&[0x01]));
    }

    #[test]
    fn command_line_overrides_file() {
        let file: Config = toml::from_str(
            "[net]\naddress = \"192.168.178.23\"\nport = 1000\n",
        )
        .unwrap();

        let s = settings(Some(file.net.clone()), None, Some(2000)).unwrap();
        assert_eq!(s, NetSettings::new("192.168.178.23", 2000));

        let s = settings(Some(file.net), Some("target".into()), None).unwrap();
        assert_eq!(s, NetSettings::new("target", 1000));

        let s = settings(None, Some("target".into()), None).unwrap();
        assert_eq!(s.port, DEFAULT_PORT);

        assert!(settings(None, None, Some(1000)).is_err());
    }

    #[test]
    fn cli_parses() {
        let args = Args::try_parse_from([
            "xcp-client", "-a", "target", "send", "ff", "0",
        ])
        .unwrap();
        match args.cmd {
            Cmd::Send { bytes } => assert_eq!(bytes, [0xff, 0]),
            cmd => panic!("parsed as {cmd:?}"),
        }

        let args =
            Args::try_parse_from(["xcp-client", "-a", "t", "ping", "-n", "2"])
                .unwrap();
        assert!(matches!(args.cmd, Cmd::Ping { count: 2 }));

        assert!(Args::try_parse_from(["xcp-client", "send"]).is_err());
    }
}
