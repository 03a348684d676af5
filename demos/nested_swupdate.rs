//! Build an SWUpdate package in memory and show the nested tokenization
//!
//! The package is a new-ascii cpio holding `sw-description` and a tar
//! archive, so the tree has the SWUpdate container at the top, the cpio
//! below it and the tar below that.

use emx_archive::{try_load_archive, DirScratch, Encoder};
use std::io::Cursor;

fn newc_entry(out: &mut Vec<u8>, name: &str, mode: u32, data: &[u8]) {
    let fields = [1, mode, 0, 0, 1, 0, data.len() as u32, 0, 0, 0, 0, name.len() as u32 + 1, 0];
    out.extend_from_slice(b"070701");
    for field in fields {
        out.extend_from_slice(format!("{:08X}", field).as_bytes());
    }
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out.resize(out.len().next_multiple_of(4), 0);
    out.extend_from_slice(data);
    out.resize(out.len().next_multiple_of(4), 0);
}

fn tar_entry(out: &mut Vec<u8>, name: &str, data: &[u8]) {
    let mut header = [0u8; 512];
    header[..name.len()].copy_from_slice(name.as_bytes());
    header[100..108].copy_from_slice(b"0000644\0");
    header[108..116].copy_from_slice(b"0000000\0");
    header[116..124].copy_from_slice(b"0000000\0");
    header[124..136].copy_from_slice(format!("{:011o}\0", data.len()).as_bytes());
    header[136..148].copy_from_slice(b"00000000000\0");
    header[148..156].fill(b' ');
    header[156] = b'0';
    let sum: u32 = header.iter().map(|&b| u32::from(b)).sum();
    header[148..156].copy_from_slice(format!("{:06o}\0 ", sum).as_bytes());

    out.extend_from_slice(&header);
    out.extend_from_slice(data);
    out.resize(out.len().next_multiple_of(512), 0);
}

fn main() -> anyhow::Result<()> {
    let mut rootfs = Vec::new();
    tar_entry(&mut rootfs, "etc/hostname", b"demo-board\n");
    tar_entry(&mut rootfs, "etc/version", b"1.2.3\n");
    rootfs.resize(rootfs.len() + 1024, 0);

    let mut package = Vec::new();
    newc_entry(&mut package, "sw-description", 0o100644, b"software = { version = \"1.2.3\"; };");
    newc_entry(&mut package, "rootfs.tar", 0o100644, &rootfs);
    newc_entry(&mut package, "TRAILER!!!", 0, b"");

    let mut stream = Cursor::new(package);
    let tokens = try_load_archive(&mut stream, &DirScratch::system_temp(), None)?
        .ok_or_else(|| anyhow::anyhow!("package was not recognized"))?;

    println!("{} ({})", tokens.archive_type(), tokens.subtype());
    for (depth, nested) in tokens.nested_archives() {
        println!(
            "{}{} ({}) files: {}",
            "  ".repeat(depth),
            nested.archive_type(),
            nested.subtype(),
            nested.payload_names().join(", ")
        );
    }

    println!("\n{}", Encoder::new().with_pretty(true).encode(&tokens)?);
    Ok(())
}
