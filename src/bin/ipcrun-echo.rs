// src/bin/ipcrun-echo.rs

//! Reference child for ipcrun.
//!
//! Speaks both protocols:
//! - standard-stream: read stdin until EOF, echo every non-blank line to
//!   stdout, exit.
//! - `socket <port>`: connect to `127.0.0.1:<port>`, echo every line back on
//!   the connection until the other side closes it, exit.
//!
//! The flags make it misbehave in controlled ways for tests and demos.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "ipcrun-echo", about = "Echo child for ipcrun", long_about = None)]
struct Args {
    /// Exit status to end with.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    exit_code: i32,

    /// Line written before any input is read (repeatable).
    #[arg(long, value_name = "LINE")]
    emit: Vec<String>,

    /// Line written to stderr at startup (repeatable).
    #[arg(long, value_name = "LINE")]
    stderr: Vec<String>,

    /// Pause between emitted lines.
    #[arg(long, default_value_t = 0, value_name = "MS")]
    delay_ms: u64,

    /// Pause before reading any input.
    #[arg(long, default_value_t = 0, value_name = "MS")]
    read_delay_ms: u64,

    /// Pause after the input ended, before exiting.
    #[arg(long, default_value_t = 0, value_name = "MS")]
    hold_ms: u64,

    /// Prefix added to every echoed line.
    #[arg(long, default_value = "")]
    prefix: String,

    /// Exit right after startup output, without reading input.
    #[arg(long)]
    exit_immediately: bool,

    /// Socket mode: never connect back (with `--exit-immediately`, exit
    /// instead of waiting).
    #[arg(long)]
    no_connect: bool,

    /// `socket` selects the socket protocol.
    transport: Option<String>,

    /// Loopback port to connect to in socket mode.
    port: Option<u16>,
}

fn main() {
    let args = Args::parse();
    let code = match run(&args) {
        Ok(()) => args.exit_code,
        Err(err) => {
            eprintln!("ipcrun-echo: {err:#}");
            2
        }
    };
    std::process::exit(code);
}

fn run(args: &Args) -> Result<()> {
    let mut stderr = io::stderr().lock();
    for line in &args.stderr {
        writeln!(stderr, "{line}")?;
    }
    stderr.flush()?;

    match (args.transport.as_deref(), args.port) {
        (Some("socket"), Some(port)) => run_socket(args, port),
        (Some("socket"), None) => bail!("socket mode needs a port"),
        (Some(other), _) => bail!("unknown transport '{other}'"),
        (None, _) => run_stdio(args),
    }
}

fn run_stdio(args: &Args) -> Result<()> {
    let mut stdout = io::stdout().lock();
    emit(&mut stdout, args)?;
    if args.exit_immediately {
        return Ok(());
    }
    pause(args.read_delay_ms);

    for line in io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        writeln!(stdout, "{}{}", args.prefix, line)?;
        stdout.flush()?;
    }

    pause(args.hold_ms);
    Ok(())
}

fn run_socket(args: &Args, port: u16) -> Result<()> {
    if args.no_connect {
        if !args.exit_immediately {
            thread::sleep(Duration::from_secs(60));
        }
        return Ok(());
    }

    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
        .with_context(|| format!("connecting to 127.0.0.1:{port}"))?;
    let mut writer = stream.try_clone().context("cloning socket")?;
    emit(&mut writer, args)?;
    if args.exit_immediately {
        return Ok(());
    }
    pause(args.read_delay_ms);

    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            // The other side tearing down the connection ends the session.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => break,
            Err(e) => return Err(e).context("reading socket"),
        };
        writeln!(writer, "{}{}", args.prefix, line)?;
        writer.flush()?;
    }

    pause(args.hold_ms);
    Ok(())
}

fn emit(out: &mut impl Write, args: &Args) -> Result<()> {
    for (i, line) in args.emit.iter().enumerate() {
        if i > 0 && args.delay_ms > 0 {
            thread::sleep(Duration::from_millis(args.delay_ms));
        }
        writeln!(out, "{line}")?;
        out.flush()?;
    }
    Ok(())
}

fn pause(ms: u64) {
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms));
    }
}
