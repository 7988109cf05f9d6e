//! Flint - run a flat guest program on a single KVM vCPU.
//!
//! The guest is loaded at the start of one page of guest memory and executed
//! in real mode until it halts. Bytes it writes to COM1 (port 0x3f8) appear
//! on stdout.
//!
//! This VMM requires Linux with KVM support. It will not run on other platforms.

#[cfg(target_os = "linux")]
mod boot;
#[cfg(target_os = "linux")]
mod devices;
#[cfg(target_os = "linux")]
mod hypervisor;
#[cfg(target_os = "linux")]
mod kvm;
mod logging;
#[cfg(target_os = "linux")]
mod memory;
#[cfg(target_os = "linux")]
mod vmm;

use clap::Parser;
use log::error;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;

fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

#[derive(Parser, Debug)]
#[command(name = "flint")]
#[command(about = "Run a flat guest program on a single KVM vCPU")]
struct Args {
    /// Raw guest binary to load (defaults to the built-in adder program)
    #[arg(short, long)]
    program: Option<PathBuf>,

    /// Initial value of RAX
    #[arg(long, default_value = "2", value_parser = parse_u64)]
    rax: u64,

    /// Initial value of RBX
    #[arg(long, default_value = "2", value_parser = parse_u64)]
    rbx: u64,

    /// Guest-physical load address and entry point
    #[arg(long, default_value = "0x1000", value_parser = parse_u64)]
    load_addr: u64,

    /// Guest memory size in bytes
    #[arg(short, long, default_value = "0x1000", value_parser = parse_u64)]
    mem_size: u64,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let _logger = match logging::initialize(args.verbose) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = run(args) {
        error!("{e}");
        let mut source = e.source();
        while let Some(cause) = source {
            error!("  caused by: {cause}");
            source = cause.source();
        }
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn Error>> {
    use log::info;
    use memory::GuestLayout;
    use vmm::VmConfig;

    let program = match &args.program {
        Some(path) => {
            std::fs::read(path).map_err(|e| format!("Failed to read {}: {e}", path.display()))?
        }
        None => boot::ADDER_PROGRAM.to_vec(),
    };

    let config = VmConfig {
        layout: GuestLayout {
            load_addr: args.load_addr,
            region_size: args.mem_size,
        },
        program,
        rax: args.rax,
        rbx: args.rbx,
    };

    info!(
        "Program: {} bytes at {:#x}, memory: {:#x} bytes",
        config.program.len(),
        config.layout.load_addr,
        config.layout.region_size
    );

    let (summary, _) = vmm::launch(config, std::io::stdout())?;
    info!(
        "Guest wrote {} bytes over {} exits",
        summary.bytes_written, summary.exits
    );

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn Error>> {
    Err("Flint requires Linux with KVM support. This platform is not supported.".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u64_accepts_hex_and_decimal() {
        assert_eq!(parse_u64("0x1000"), Ok(0x1000));
        assert_eq!(parse_u64("4096"), Ok(4096));
        assert!(parse_u64("0xzz").is_err());
    }

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["flint"]);
        assert_eq!(args.rax, 2);
        assert_eq!(args.rbx, 2);
        assert_eq!(args.load_addr, 0x1000);
        assert_eq!(args.mem_size, 0x1000);
        assert!(args.program.is_none());
        assert_eq!(args.verbose, 0);
    }

    #[test]
    fn test_verbose_counts() {
        let args = Args::parse_from(["flint", "-vv", "--rax", "0x3"]);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.rax, 3);
    }
}
