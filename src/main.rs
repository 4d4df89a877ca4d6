use clap::Parser;
use csopack::codec::{Method, MethodSet};
use csopack::job::{CodecFlags, Job, Mode};
use csopack::pipeline::{Event, JobStatus, Pipeline, PipelineOptions};
use csopack::FormatVariant;
use std::collections::HashMap;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "csopack", version, about = "Compress disc images into CSO, ZSO and DAX containers")]
struct Cli {
    /// Images or containers to process
    #[arg(required = true, num_args = 1..)]
    inputs: Vec<PathBuf>,
    /// Output file, once per input (default: input name with a new extension)
    #[arg(short, long)]
    output: Vec<PathBuf>,
    /// Directory for derived output names
    #[arg(long)]
    output_path: Option<PathBuf>,
    /// Worker threads (0 = one per CPU)
    #[arg(long, default_value = "0")]
    threads: usize,
    /// Suppress progress and status output
    #[arg(short, long)]
    quiet: bool,
    /// Print the CRC32 of each decoded image instead of writing output
    #[arg(long)]
    crc: bool,
    /// Decompress containers back to raw images
    #[arg(long)]
    decompress: bool,
    /// Skip the exhaustive methods
    #[arg(long)]
    fast: bool,
    /// Block size in bytes (default: 2048, or 16384 for images of 2 GiB and up)
    #[arg(long)]
    block: Option<u32>,
    /// Container format: cso1, cso2, zso, dax
    #[arg(long, default_value = "cso1", value_parser = parse_format)]
    format: FormatVariant,
    /// Enable methods the format leaves off by default
    #[arg(long = "use", value_name = "METHODS", value_delimiter = ',', value_parser = parse_methods)]
    enable: Vec<MethodSet>,
    /// Disable methods
    #[arg(long = "no", value_name = "METHODS", value_delimiter = ',', value_parser = parse_methods)]
    disable: Vec<MethodSet>,
    /// Try only these methods
    #[arg(long, value_name = "METHODS", value_delimiter = ',', value_parser = parse_methods)]
    only: Vec<MethodSet>,
    /// Prefer LZ4 when it is at most this many percent larger than the best result
    #[arg(long, default_value = "0")]
    lz4_cost: f64,
    /// Store blocks raw when at most this many percent larger than the best result
    #[arg(long, default_value = "0")]
    orig_cost: f64,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.quiet { "error" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let jobs = match build_jobs(&cli) {
        Ok(jobs) => jobs,
        Err(msg) => {
            eprintln!("error: {msg}");
            return ExitCode::from(2);
        }
    };
    let pipeline = match Pipeline::new(PipelineOptions { threads: cli.threads }) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let names: Vec<String> = jobs.iter().map(|j| j.input.display().to_string()).collect();
    let (tx, rx) = mpsc::channel();
    let worker = thread::spawn(move || {
        pipeline
            .run_all(&jobs, &tx)
            .iter()
            .all(Result::is_ok)
    });

    let mut console = Console::new(cli.quiet, cli.crc);
    for event in rx {
        console.render(&names, event);
    }

    match worker.join() {
        Ok(true) => ExitCode::SUCCESS,
        _        => ExitCode::FAILURE,
    }
}

// ── Job construction ─────────────────────────────────────────────────────────

fn build_jobs(cli: &Cli) -> Result<Vec<Job>, String> {
    if !cli.output.is_empty() && cli.output.len() != cli.inputs.len() {
        return Err(format!(
            "{} inputs but {} outputs; give one -o per input or none",
            cli.inputs.len(),
            cli.output.len()
        ));
    }
    if cli.crc && cli.decompress {
        return Err("--crc and --decompress cannot be combined".into());
    }
    let mode = if cli.crc {
        Mode::Checksum
    } else if cli.decompress {
        Mode::Decompress
    } else {
        Mode::Compress
    };
    let merge = |sets: &[MethodSet]| sets.iter().fold(MethodSet::EMPTY, |acc, s| acc.union(*s));
    let codecs = CodecFlags {
        enable:  merge(&cli.enable),
        disable: merge(&cli.disable),
        only:    merge(&cli.only),
        fast:    cli.fast,
    };

    Ok(cli
        .inputs
        .iter()
        .enumerate()
        .map(|(i, input)| {
            let output = match mode {
                Mode::Checksum => None,
                _ => Some(cli.output.get(i).cloned().unwrap_or_else(|| {
                    derive_output(input, mode, cli.format, cli.output_path.as_deref())
                })),
            };
            Job {
                input: input.clone(),
                output,
                mode,
                format: cli.format,
                block_size: cli.block,
                codecs,
                orig_cost_percent: cli.orig_cost,
                lz4_cost_percent: cli.lz4_cost,
            }
        })
        .collect())
}

/// `game.iso` becomes `game.cso` (or `.zso`/`.dax`), and back to `.iso`.
fn derive_output(input: &Path, mode: Mode, format: FormatVariant, dir: Option<&Path>) -> PathBuf {
    let ext = match mode {
        Mode::Decompress => ".iso",
        _                => format.extension(),
    };
    let stem = input.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = format!("{stem}{ext}");
    match dir {
        Some(dir) => dir.join(name),
        None      => input.with_file_name(name),
    }
}

fn parse_format(s: &str) -> Result<FormatVariant, String> {
    FormatVariant::from_name(s).ok_or_else(|| format!("unknown format '{s}' (cso1, cso2, zso, dax)"))
}

/// Method groups, then individual method names.
fn parse_methods(s: &str) -> Result<MethodSet, String> {
    let group: &[Method] = match s.to_lowercase().as_str() {
        "zlib"        => &[Method::Zlib, Method::ZlibBrute],
        "lz4"         => &[Method::Lz4, Method::Lz4Hc],
        "lz4brute"    => &[Method::Lz4HcBrute],
        "7zip"        => &[Method::Deflate7z],
        "deflate"     => return Ok(MethodSet::DEFLATE),
        "all"         => return Ok(MethodSet::ALL),
        other => {
            return Method::from_name(other)
                .map(MethodSet::single)
                .ok_or_else(|| format!("unknown method '{s}'"))
        }
    };
    Ok(group.iter().copied().collect())
}

// ── Console output ───────────────────────────────────────────────────────────

struct Console {
    quiet:    bool,
    crc:      bool,
    live:     bool,
    started:  HashMap<usize, Instant>,
}

impl Console {
    fn new(quiet: bool, crc: bool) -> Self {
        Self { quiet, crc, live: std::io::stderr().is_terminal(), started: HashMap::new() }
    }

    fn render(&mut self, names: &[String], event: Event) {
        match event {
            Event::Progress { job, position, total, written } => {
                let started = *self.started.entry(job).or_insert_with(Instant::now);
                if self.quiet || !self.live || total == 0 {
                    return;
                }
                let pct = position as f64 * 100.0 / total as f64;
                let ratio = if position == 0 { 0.0 } else { written as f64 * 100.0 / position as f64 };
                let secs = started.elapsed().as_secs_f64();
                let speed = if secs > 0.0 { position as f64 / secs / (1 << 20) as f64 } else { 0.0 };
                let mut err = std::io::stderr();
                let _ = write!(
                    err,
                    "\r{}: {pct:5.1}%, ratio={ratio:3.0}%, speed={speed:6.2} MB/s\x1b[K",
                    names[job]
                );
                let _ = err.flush();
            }
            Event::Finished { job, status, reason } => {
                self.started.remove(&job);
                if self.live && !self.quiet {
                    eprint!("\r\x1b[K");
                }
                match status {
                    JobStatus::Success if self.crc => println!("{}: {reason}", names[job]),
                    JobStatus::Success => {
                        if !self.quiet {
                            eprintln!("{}: {reason}", names[job]);
                        }
                    }
                    JobStatus::Failure => eprintln!("{}: failed: {reason}", names[job]),
                }
            }
        }
    }
}
