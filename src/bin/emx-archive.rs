//! emx-archive CLI
//!
//! Detect archive formats and dump their token trees as JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emx_archive::{
    ArchiveLoader, ArchiveTokenization, Decoder, DirScratch, Encoder, FormatRegistry, LoaderConfig,
    NestedDetection,
};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "emx-archive")]
#[command(author = "nzinfo <li.monan@gmail.com>")]
#[command(version)]
#[command(about = "Archive format detection and tokenization tool")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct LoadArgs {
    /// Only try formats of this archive type (cpio, tar, ext4, swupdate)
    #[arg(short = 't', long = "type")]
    hint: Option<String>,

    /// Directory for temporary files (default: system temp dir)
    #[arg(long)]
    scratch: Option<PathBuf>,

    /// Keep payload bytes up to this size in the token tree
    #[arg(long, default_value_t = 0)]
    inline_limit: u64,

    /// Maximum nesting depth of archives inside archives
    #[arg(long, default_value_t = 8)]
    max_depth: usize,

    /// Check every payload for nested archives, not only known extensions
    #[arg(long, conflicts_with = "no_nested")]
    sniff: bool,

    /// Do not look inside payloads
    #[arg(long)]
    no_nested: bool,
}

impl LoadArgs {
    fn config(&self) -> LoaderConfig {
        let nested = if self.no_nested {
            NestedDetection::Disabled
        } else if self.sniff {
            NestedDetection::Sniff
        } else {
            NestedDetection::ByExtension
        };
        LoaderConfig::default()
            .with_max_depth(self.max_depth)
            .with_inline_payload_limit(self.inline_limit)
            .with_nested(nested)
    }

    fn scratch(&self) -> DirScratch {
        match &self.scratch {
            Some(dir) => DirScratch::new(dir),
            None => DirScratch::system_temp(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the detected type and subtype of an archive
    Detect {
        /// Archive file
        input: PathBuf,

        #[command(flatten)]
        load: LoadArgs,
    },

    /// Tokenize an archive and write the token tree as JSON
    Tokenize {
        /// Archive file
        input: PathBuf,

        /// Output JSON file (default: stdout)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Single-line JSON instead of indented
        #[arg(long)]
        compact: bool,

        #[command(flatten)]
        load: LoadArgs,
    },

    /// Detect every file below a directory
    Scan {
        /// Directory to walk
        directory: PathBuf,

        #[command(flatten)]
        load: LoadArgs,
    },

    /// Check that a token tree describes an archive byte for byte
    Verify {
        /// Archive file
        input: PathBuf,

        /// Previously written token JSON (default: tokenize the archive now)
        #[arg(short = 'j', long)]
        tokens: Option<PathBuf>,

        #[command(flatten)]
        load: LoadArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let registry = FormatRegistry::with_standard_formats();

    match cli.command {
        Commands::Detect { input, load } => detect(&registry, &input, &load),
        Commands::Tokenize { input, output, compact, load } => {
            tokenize(&registry, &input, output.as_deref(), compact, &load)
        }
        Commands::Scan { directory, load } => scan(&registry, &directory, &load),
        Commands::Verify { input, tokens, load } => verify(&registry, &input, tokens.as_deref(), &load),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load(registry: &FormatRegistry, path: &Path, args: &LoadArgs) -> Result<Option<ArchiveTokenization>> {
    let mut file = fs::File::open(path).with_context(|| format!("Failed to open: {}", path.display()))?;
    let loader = ArchiveLoader::new(registry, args.config());
    let tokens = loader
        .try_load_archive(&mut file, &args.scratch(), args.hint.as_deref())
        .with_context(|| format!("Failed to tokenize: {}", path.display()))?;
    Ok(tokens)
}

fn detect(registry: &FormatRegistry, input: &Path, args: &LoadArgs) -> Result<()> {
    match load(registry, input, args)? {
        Some(tokens) => {
            println!("{}\t{}\t{}", tokens.archive_type(), tokens.subtype(), tokens.length());
            for (depth, nested) in tokens.nested_archives() {
                println!("{}{}\t{}", "  ".repeat(depth), nested.archive_type(), nested.subtype());
            }
        }
        None => anyhow::bail!("Unsupported archive format: {}", input.display()),
    }
    Ok(())
}

fn tokenize(
    registry: &FormatRegistry,
    input: &Path,
    output: Option<&Path>,
    compact: bool,
    args: &LoadArgs,
) -> Result<()> {
    let tokens = load(registry, input, args)?
        .ok_or_else(|| anyhow::anyhow!("Unsupported archive format: {}", input.display()))?;
    let encoder = Encoder::new().with_pretty(!compact);

    if let Some(path) = output {
        encoder
            .encode_to_file(&tokens, path)
            .with_context(|| format!("Failed to write: {}", path.display()))?;
    } else {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        encoder.encode_to_writer(&tokens, &mut out)?;
        if compact {
            writeln!(out)?;
        }
    }
    Ok(())
}

fn scan(registry: &FormatRegistry, directory: &Path, args: &LoadArgs) -> Result<()> {
    let files = walkdir::WalkDir::new(directory)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file());

    for entry in files {
        let path = entry.path();
        let relative = path.strip_prefix(directory).unwrap_or(path).display();
        match load(registry, path, args) {
            Ok(Some(tokens)) => println!("{}\t{}\t{}", relative, tokens.archive_type(), tokens.subtype()),
            Ok(None) => println!("{}\t-", relative),
            Err(e) => println!("{}\terror: {:#}", relative, e),
        }
    }
    Ok(())
}

fn verify(registry: &FormatRegistry, input: &Path, json: Option<&Path>, args: &LoadArgs) -> Result<()> {
    let tokens = match json {
        Some(path) => Decoder::new()
            .decode_file(path)
            .with_context(|| format!("Failed to read tokens: {}", path.display()))?,
        None => load(registry, input, args)?
            .ok_or_else(|| anyhow::anyhow!("Unsupported archive format: {}", input.display()))?,
    };

    tokens.verify_coverage().context("Token tree does not cover the archive")?;
    tokens.verify_values().context("Token values disagree with their spans")?;

    let data = fs::read(input).with_context(|| format!("Failed to read: {}", input.display()))?;
    let covered = usize::try_from(tokens.length())
        .ok()
        .and_then(|len| data.get(..len))
        .ok_or_else(|| anyhow::anyhow!("Archive is shorter than its token tree"))?;
    if emx_archive::sha256_hex(covered) != tokens.sha256() {
        anyhow::bail!("SHA-256 of {} does not match the token tree", input.display());
    }
    let rebuilt = tokens
        .reconstruct_from(&data)
        .ok_or_else(|| anyhow::anyhow!("Token spans point outside the archive"))?;
    if rebuilt != covered {
        anyhow::bail!("Reassembled leaves differ from the archive");
    }

    match tokens.rebuild() {
        Some(bytes) if bytes != covered => anyhow::bail!("Inlined token bytes differ from the archive"),
        Some(_) => println!("OK: {} bytes, rebuilt from the token tree alone", tokens.length()),
        None => println!("OK: {} bytes", tokens.length()),
    }
    Ok(())
}
