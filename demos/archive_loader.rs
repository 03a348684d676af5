//! Detect an archive file and print its token tree
//!
//! ```text
//! cargo run --example archive_loader -- firmware.swu [type]
//! ```
//!
//! With a type argument the hinted formats are tried first; when none of
//! them matches, the same stream is tried again with every format.

use emx_archive::{ArchiveLoader, ArchiveTokenization, DirScratch, FormatRegistry, LoaderConfig, Token};
use std::fs::File;

fn print_token(token: &Token, indent: usize) {
    let span = token
        .span
        .map(|s| format!("{:>10} +{}", s.offset, s.length))
        .unwrap_or_default();
    println!("{:indent$}{:?} {} [{}]", "", token.kind, token.name, span, indent = indent);
    if let Some(nested) = &token.nested {
        print_tree(nested, indent + 4);
    }
    for child in &token.children {
        print_token(child, indent + 2);
    }
}

fn print_tree(tokens: &ArchiveTokenization, indent: usize) {
    println!(
        "{:indent$}== {} ({}) {} bytes sha256 {}",
        "",
        tokens.archive_type(),
        tokens.subtype(),
        tokens.length(),
        tokens.sha256(),
        indent = indent
    );
    for token in tokens.tokens() {
        print_token(token, indent + 2);
    }
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: archive_loader <file> [type]"))?;
    let hint = args.next();

    let registry = FormatRegistry::with_standard_formats();
    println!("Registered formats: {}", registry.archive_types().join(", "));

    let loader = ArchiveLoader::new(&registry, LoaderConfig::default().with_inline_payload_limit(64));
    let scratch = DirScratch::system_temp();
    let mut file = File::open(&path)?;

    let mut tokens = None;
    if let Some(hint) = hint.as_deref() {
        tokens = loader.try_load_archive(&mut file, &scratch, Some(hint))?;
        if tokens.is_none() {
            println!("{} is not a {} archive, trying every format", path, hint);
        }
    }
    if tokens.is_none() {
        tokens = loader.try_load_archive(&mut file, &scratch, None)?;
    }

    match tokens {
        Some(tokens) => {
            print_tree(&tokens, 0);
            tokens.verify_coverage()?;
            println!("\n{} leaves cover all {} bytes", tokens.leaves().len(), tokens.length());
        }
        None => println!("{}: unsupported archive format", path),
    }

    Ok(())
}
