//! Archive builders shared by the integration tests

#![allow(dead_code)]

use std::io::Cursor;

use emx_archive::{ArchiveLoader, ArchiveTokenization, DirScratch, FormatRegistry, LoaderConfig, Result};

pub const REGULAR: u32 = 0o100644;
pub const TRAILER: &str = "TRAILER!!!";

fn pad_to(out: &mut Vec<u8>, alignment: usize) {
    while out.len() % alignment != 0 {
        out.push(0);
    }
}

fn push_newc(out: &mut Vec<u8>, magic: &str, name: &str, mode: u32, data: &[u8]) {
    let check = if magic == "070702" {
        data.iter().fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
    } else {
        0
    };
    let values = [1, mode, 0, 0, 1, 0, data.len() as u32, 0, 0, 0, 0, name.len() as u32 + 1, check];
    out.extend_from_slice(magic.as_bytes());
    for v in values {
        out.extend_from_slice(format!("{:08X}", v).as_bytes());
    }
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    pad_to(out, 4);
    out.extend_from_slice(data);
    pad_to(out, 4);
}

/// SVR4 new-ascii cpio
pub fn newc(entries: &[(&str, &[u8])]) -> Vec<u8> {
    newc_with_magic("070701", entries)
}

/// SVR4 new-ascii cpio with data checksums
pub fn newc_crc(entries: &[(&str, &[u8])]) -> Vec<u8> {
    newc_with_magic("070702", entries)
}

fn newc_with_magic(magic: &str, entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, data) in entries {
        push_newc(&mut out, magic, name, REGULAR, data);
    }
    push_newc(&mut out, magic, TRAILER, 0, b"");
    out
}

/// Portable ASCII cpio
pub fn odc(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    let trailer: (&str, &[u8]) = (TRAILER, b"");
    for (name, data) in entries.iter().chain(std::iter::once(&trailer)) {
        let mode = if *name == TRAILER { 0 } else { REGULAR };
        let header = format!(
            "070707{:06o}{:06o}{:06o}{:06o}{:06o}{:06o}{:06o}{:011o}{:06o}{:011o}",
            0,
            1,
            mode,
            0,
            0,
            1,
            0,
            0,
            name.len() + 1,
            data.len()
        );
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        out.extend_from_slice(data);
    }
    out
}

/// Old binary cpio
pub fn binary_cpio(entries: &[(&str, &[u8])], big_endian: bool) -> Vec<u8> {
    let mut out = Vec::new();
    let trailer: (&str, &[u8]) = (TRAILER, b"");
    for (name, data) in entries.iter().chain(std::iter::once(&trailer)) {
        let mode = if *name == TRAILER { 0 } else { REGULAR as u16 };
        let size = data.len() as u32;
        let words: [u16; 13] = [
            0o070707,
            0,
            1,
            mode,
            0,
            0,
            1,
            0,
            0,
            0,
            name.len() as u16 + 1,
            (size >> 16) as u16,
            size as u16,
        ];
        for w in words {
            let bytes = if big_endian { w.to_be_bytes() } else { w.to_le_bytes() };
            out.extend_from_slice(&bytes);
        }
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        pad_to(&mut out, 2);
        out.extend_from_slice(data);
        pad_to(&mut out, 2);
    }
    out
}

fn tar_header(name: &str, size: usize) -> Vec<u8> {
    let mut h = vec![0u8; 512];
    h[..name.len()].copy_from_slice(name.as_bytes());
    h[100..108].copy_from_slice(b"0000644\0");
    h[108..116].copy_from_slice(b"0000000\0");
    h[116..124].copy_from_slice(b"0000000\0");
    h[124..136].copy_from_slice(format!("{:011o}\0", size).as_bytes());
    h[136..148].copy_from_slice(b"00000000000\0");
    h[156] = b'0';
    h[257..263].copy_from_slice(b"ustar\0");
    h[263..265].copy_from_slice(b"00");
    let sum: u32 = h
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { u32::from(b' ') } else { u32::from(b) })
        .sum();
    h[148..156].copy_from_slice(format!("{:06o}\0 ", sum).as_bytes());
    h
}

/// ustar archive with a two-block terminator
pub fn tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, data) in entries {
        out.extend(tar_header(name, data.len()));
        out.extend_from_slice(data);
        pad_to(&mut out, 512);
    }
    out.resize(out.len() + 1024, 0);
    out
}

/// SWUpdate package: new-ascii cpio led by `sw-description`
pub fn swu(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let description: (&str, &[u8]) = ("sw-description", b"software = { version = \"1.0\"; };");
    let mut all = vec![description];
    all.extend_from_slice(entries);
    newc(&all)
}

pub const EXT_BLOCK: usize = 1024;
pub const EXT_BLOCKS: usize = 64;
const EXT_INODES: usize = 16;
const EXT_INODE_SIZE: usize = 128;
const EXT_INODE_TABLE: usize = 5;
const EXT_ROOT_DIR_BLOCK: usize = 7;
/// First block handed out to file content
pub const EXT_FIRST_DATA: usize = 9;
const EXT_FIRST_FILE_INODE: u32 = 12;

/// A file placed in the root directory of a test image
pub struct ExtFile<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
    /// Leave a free block between consecutive data blocks
    pub fragmented: bool,
}

impl<'a> ExtFile<'a> {
    pub fn new(name: &'a str, data: &'a [u8]) -> Self {
        Self { name, data, fragmented: false }
    }

    pub fn fragmented(name: &'a str, data: &'a [u8]) -> Self {
        Self { name, data, fragmented: true }
    }
}

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

/// Runs of consecutive blocks as (logical, physical, len)
fn runs(blocks: &[usize]) -> Vec<(usize, usize, usize)> {
    let mut out: Vec<(usize, usize, usize)> = Vec::new();
    for (logical, &physical) in blocks.iter().enumerate() {
        match out.last_mut() {
            Some(last) if last.1 + last.2 == physical => last.2 += 1,
            _ => out.push((logical, physical, 1)),
        }
    }
    out
}

fn write_inode(image: &mut [u8], number: u32, mode: u16, size: usize, blocks: &[usize], extents: bool) {
    let at = EXT_INODE_TABLE * EXT_BLOCK + (number as usize - 1) * EXT_INODE_SIZE;
    let inode = &mut image[at..at + EXT_INODE_SIZE];
    put_u16(inode, 0, mode);
    put_u32(inode, 4, size as u32);
    put_u16(inode, 0x1A, 1);
    put_u32(inode, 0x1C, (blocks.len() * EXT_BLOCK / 512) as u32);

    let i_block = &mut inode[0x28..0x64];
    if extents {
        let runs = runs(blocks);
        assert!(runs.len() <= 4, "test image supports four extents per inode");
        put_u16(i_block, 0, 0xF30A);
        put_u16(i_block, 2, runs.len() as u16);
        put_u16(i_block, 4, 4);
        put_u16(i_block, 6, 0);
        for (i, (logical, physical, len)) in runs.into_iter().enumerate() {
            let e = 12 + 12 * i;
            put_u32(i_block, e, logical as u32);
            put_u16(i_block, e + 4, len as u16);
            put_u16(i_block, e + 6, 0);
            put_u32(i_block, e + 8, physical as u32);
        }
        put_u32(inode, 0x20, 0x80000);
    } else {
        assert!(blocks.len() <= 12, "test image supports direct blocks only");
        for (i, &block) in blocks.iter().enumerate() {
            put_u32(i_block, 4 * i, block as u32);
        }
    }
}

fn push_dirent(block: &mut Vec<u8>, inode: u32, name: &str, file_type: u8, last: bool) {
    let start = block.len();
    let rec_len = if last { EXT_BLOCK - start } else { (8 + name.len()).next_multiple_of(4) };
    block.extend_from_slice(&inode.to_le_bytes());
    block.extend_from_slice(&(rec_len as u16).to_le_bytes());
    block.push(name.len() as u8);
    block.push(file_type);
    block.extend_from_slice(name.as_bytes());
    block.resize(start + rec_len, 0);
}

/// Single-group 64 KiB image with 1 KiB blocks and the given files in its
/// root directory. `extents` selects extent-mapped ext4 inodes; otherwise
/// the image is ext2 with classic block maps.
///
/// Layout: boot area, superblock, descriptors (block 2), block bitmap (3),
/// inode bitmap (4), inode table (5-6), root directory (7), file data from
/// block 9.
pub fn ext4_image(extents: bool, files: &[ExtFile<'_>]) -> Vec<u8> {
    let mut image = vec![0u8; EXT_BLOCKS * EXT_BLOCK];

    let sb = &mut image[1024..2048];
    put_u32(sb, 0, EXT_INODES as u32);
    put_u32(sb, 4, EXT_BLOCKS as u32);
    put_u32(sb, 20, 1);
    put_u32(sb, 24, 0);
    put_u32(sb, 32, 8192);
    put_u32(sb, 36, 8192);
    put_u32(sb, 40, EXT_INODES as u32);
    put_u16(sb, 56, 0xEF53);
    put_u16(sb, 58, 1);
    put_u32(sb, 96, if extents { 0x40 } else { 0 });
    sb[120..124].copy_from_slice(b"test");

    let gd = &mut image[2048..2080];
    put_u32(gd, 0, 3);
    put_u32(gd, 4, 4);
    put_u32(gd, 8, EXT_INODE_TABLE as u32);

    let mut dir = Vec::with_capacity(EXT_BLOCK);
    push_dirent(&mut dir, 2, ".", 2, false);
    push_dirent(&mut dir, 2, "..", 2, files.is_empty());

    let mut next = EXT_FIRST_DATA;
    for (i, file) in files.iter().enumerate() {
        let number = EXT_FIRST_FILE_INODE + i as u32;
        let count = file.data.len().div_ceil(EXT_BLOCK);
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(next);
            next += if file.fragmented { 2 } else { 1 };
        }
        assert!(next <= EXT_BLOCKS, "test image is full");
        for (chunk, &block) in file.data.chunks(EXT_BLOCK).zip(&blocks) {
            image[block * EXT_BLOCK..block * EXT_BLOCK + chunk.len()].copy_from_slice(chunk);
        }
        write_inode(&mut image, number, 0o100644, file.data.len(), &blocks, extents);
        push_dirent(&mut dir, number, file.name, 1, i + 1 == files.len());
    }

    image[EXT_ROOT_DIR_BLOCK * EXT_BLOCK..(EXT_ROOT_DIR_BLOCK + 1) * EXT_BLOCK].copy_from_slice(&dir);
    write_inode(&mut image, 2, 0o40755, EXT_BLOCK, &[EXT_ROOT_DIR_BLOCK], extents);
    image
}

/// Detect `data` with the standard formats
pub fn load(data: &[u8], config: LoaderConfig) -> Result<Option<ArchiveTokenization>> {
    load_hinted(data, config, None)
}

pub fn load_hinted(data: &[u8], config: LoaderConfig, hint: Option<&str>) -> Result<Option<ArchiveTokenization>> {
    let registry = FormatRegistry::with_standard_formats();
    let loader = ArchiveLoader::new(&registry, config);
    let mut cursor = Cursor::new(data.to_vec());
    loader.try_load_archive(&mut cursor, &DirScratch::system_temp(), hint)
}

/// Loader settings that keep every byte in the tree
pub fn inline_all() -> LoaderConfig {
    LoaderConfig::default().with_inline_payload_limit(1 << 20)
}
