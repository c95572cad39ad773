//! hidport CLI: inspect the platform profile and talk to raw HID devices.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hidport_core::{DeviceHandle, HidContext, PlatformProfile, PlatformTag, Timeout};
use tracing::debug;

#[derive(Parser)]
#[command(name = "hidport", version, about = "Portable raw HID device access")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// How to pick the device to open.
#[derive(Args)]
struct Target {
    /// Platform device path (takes precedence over ids).
    #[arg(long)]
    path: Option<String>,
    /// Vendor id, decimal or 0x-prefixed hex.
    #[arg(long, value_parser = parse_u16)]
    vid: Option<u16>,
    /// Product id, decimal or 0x-prefixed hex.
    #[arg(long, value_parser = parse_u16)]
    pid: Option<u16>,
    /// Serial number to match.
    #[arg(long)]
    serial: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the polling/threading profile of this build or of a named target.
    Profile {
        /// Target tag: linux, linux-hidraw, darwin, windows.
        #[arg(long)]
        target: Option<String>,
    },
    /// List attached HID devices.
    ListDevices {
        #[arg(long, value_parser = parse_u16, default_value = "0")]
        vid: u16,
        #[arg(long, value_parser = parse_u16, default_value = "0")]
        pid: u16,
        /// Print JSON instead of one line per device.
        #[arg(long)]
        json: bool,
    },
    /// Read input reports and print them as hex.
    Read {
        #[command(flatten)]
        target: Target,
        /// Number of reports to read.
        #[arg(long, default_value = "1")]
        count: usize,
        /// Per-report timeout in milliseconds; negative blocks forever.
        #[arg(long, default_value = "-1", allow_negative_numbers = true)]
        timeout_ms: i32,
    },
    /// Write an output report given as hex (first byte is the report id).
    Write {
        #[command(flatten)]
        target: Target,
        data: String,
    },
    /// Fetch a feature report.
    GetFeature {
        #[command(flatten)]
        target: Target,
        #[arg(long, value_parser = parse_u8)]
        report_id: u8,
        /// Buffer length including the report id byte.
        #[arg(long, default_value = "65")]
        len: usize,
    },
    /// Send a feature report given as hex (first byte is the report id).
    SendFeature {
        #[command(flatten)]
        target: Target,
        data: String,
    },
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(digits) => u16::from_str_radix(digits, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid id '{s}': {e}"))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let wide = parse_u16(s)?;
    u8::try_from(wide).map_err(|_| format!("'{s}' does not fit in a byte"))
}

/// Parse hex bytes, ignoring whitespace, `:` separators and a `0x` prefix.
fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let trimmed = s.trim();
    let digits: String = trimmed
        .strip_prefix("0x")
        .unwrap_or(trimmed)
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        anyhow::bail!("hex data must have an even, non-zero number of digits: '{s}'");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn open_target(ctx: &mut HidContext, target: &Target) -> Result<DeviceHandle> {
    if let Some(path) = &target.path {
        return ctx
            .open_path(path)
            .with_context(|| format!("open HID device at {path}"));
    }
    let (Some(vid), Some(pid)) = (target.vid, target.pid) else {
        anyhow::bail!("either --path or both --vid and --pid are required");
    };
    ctx.open(vid, pid, target.serial.as_deref())
        .with_context(|| format!("open HID device (VID=0x{vid:04X} PID=0x{pid:04X})"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Profile { target } => {
            let tag = match target {
                Some(name) => name.parse::<PlatformTag>()?,
                None => PlatformTag::current(),
            };
            let profile = PlatformProfile::resolve(tag);
            debug!(%tag, ?profile, "Resolved platform profile");
            let report = serde_json::json!({
                "target": tag,
                "profile": profile,
                "self_contained": profile.is_self_contained(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::ListDevices { vid, pid, json } => {
            let mut ctx = HidContext::new()?;
            let devices = ctx.enumerate(vid, pid)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if devices.is_empty() {
                println!("No HID devices found.");
            } else {
                for dev in &devices {
                    println!(
                        "{} {} (VID: 0x{:04X}, PID: 0x{:04X}, usage: 0x{:04X}/0x{:04X}, path: {})",
                        dev.manufacturer.as_deref().unwrap_or("?"),
                        dev.product.as_deref().unwrap_or("?"),
                        dev.vendor_id,
                        dev.product_id,
                        dev.usage_page,
                        dev.usage,
                        dev.path
                    );
                }
            }
        }
        Commands::Read {
            target,
            count,
            timeout_ms,
        } => {
            let mut ctx = HidContext::new()?;
            let handle = open_target(&mut ctx, &target)?;
            debug!(path = %handle.info().path, count, timeout_ms, "Reading reports");
            let timeout = Timeout::from_millis(timeout_ms);
            for _ in 0..count {
                match handle.next_report(timeout)? {
                    Some(report) => println!("{}", hex(&report)),
                    None => {
                        println!("(timed out after {timeout_ms} ms)");
                        break;
                    }
                }
            }
            handle.close()?;
        }
        Commands::Write { target, data } => {
            let bytes = parse_hex(&data)?;
            let mut ctx = HidContext::new()?;
            let handle = open_target(&mut ctx, &target)?;
            let written = handle.write(&bytes)?;
            println!("Wrote {written} bytes");
            handle.close()?;
        }
        Commands::GetFeature {
            target,
            report_id,
            len,
        } => {
            if len == 0 {
                anyhow::bail!("--len must be at least 1");
            }
            let mut ctx = HidContext::new()?;
            let handle = open_target(&mut ctx, &target)?;
            let mut buf = vec![0u8; len];
            buf[0] = report_id;
            let n = handle.get_feature_report(&mut buf)?;
            println!("{}", hex(&buf[..n]));
            handle.close()?;
        }
        Commands::SendFeature { target, data } => {
            let bytes = parse_hex(&data)?;
            let mut ctx = HidContext::new()?;
            let handle = open_target(&mut ctx, &target)?;
            handle.send_feature_report(&bytes)?;
            println!("Sent feature report 0x{:02X} ({} bytes)", bytes[0], bytes.len());
            handle.close()?;
        }
    }

    Ok(())
}
