//! ext2/ext3/ext4 filesystem images
//!
//! An image is described as a set of regions: the boot area, the primary
//! superblock, the group descriptor table, each group's bitmaps and inode
//! table, the journal, and every block owned by a directory or file that is
//! reachable from the root directory. Regions are sorted by offset and the
//! space between them becomes `Gap` leaves, so the leaves tile the image.
//!
//! # Invariants
//! - Regions never overlap and never extend past `blocks_count * block_size`;
//!   an image violating either is malformed.
//! - Inline data, fast symlinks and device nodes own no blocks.
//! - A file stored in one extent is a single payload leaf; a fragmented file
//!   has one payload leaf per fragment (`name`, `name#1`, ...).

use std::collections::HashSet;

use crate::archive::{ArchiveTokenization, Token, TokenKind};
use crate::error::{ArchiveError, Result};
use crate::fields::{le_u16, le_u32};
use crate::formats::{self, FormatParser, HeaderFields};
use crate::loader::ParseContext;
use crate::scratch;
use crate::stream::{self, SubStream};

const FORMAT: &str = "ext4";
const SUPERBLOCK_OFFSET: u64 = 1024;
const SUPERBLOCK_SIZE: usize = 1024;
const MAGIC: u16 = 0xEF53;
const ROOT_INODE: u32 = 2;

const EXTENT_MAGIC: u16 = 0xF30A;
const MAX_EXTENT_DEPTH: u16 = 5;
/// Extent lengths above this mark unwritten (preallocated) extents
const EXTENT_INIT_MAX_LEN: u16 = 32768;

const COMPAT_HAS_JOURNAL: u32 = 0x4;

const INCOMPAT_COMPRESSION: u32 = 0x1;
const INCOMPAT_JOURNAL_DEV: u32 = 0x8;
const INCOMPAT_META_BG: u32 = 0x10;
const INCOMPAT_64BIT: u32 = 0x80;
/// extents, 64bit, mmp, flex_bg, ea_inode, dirdata, csum_seed, largedir,
/// inline_data, encrypt
const INCOMPAT_EXT4: u32 = 0x40 | 0x80 | 0x100 | 0x200 | 0x400 | 0x1000 | 0x2000 | 0x4000 | 0x8000 | 0x10000;

const RO_COMPAT_BIGALLOC: u32 = 0x200;
/// huge_file, gdt_csum, dir_nlink, extra_isize, quota, bigalloc, metadata_csum
const RO_COMPAT_EXT4: u32 = 0x8 | 0x10 | 0x20 | 0x40 | 0x100 | 0x200 | 0x400;

const INODE_FLAG_EXTENTS: u32 = 0x80000;
const INODE_FLAG_INLINE_DATA: u32 = 0x1000_0000;

const S_IFMT: u16 = 0xF000;
const S_IFDIR: u16 = 0x4000;
const S_IFREG: u16 = 0x8000;
const S_IFLNK: u16 = 0xA000;

/// Symlink targets shorter than this live in the inode
const FAST_SYMLINK_MAX: u64 = 60;

#[derive(Clone, Copy)]
enum Field {
    Int,
    Text,
    Bytes,
}

/// Superblock fields in on-disk order, up to `s_blocks_count_hi`
const SUPERBLOCK_LAYOUT: &[(&str, usize, Field)] = &[
    ("inodes_count", 4, Field::Int),
    ("blocks_count_lo", 4, Field::Int),
    ("r_blocks_count_lo", 4, Field::Int),
    ("free_blocks_count_lo", 4, Field::Int),
    ("free_inodes_count", 4, Field::Int),
    ("first_data_block", 4, Field::Int),
    ("log_block_size", 4, Field::Int),
    ("log_cluster_size", 4, Field::Int),
    ("blocks_per_group", 4, Field::Int),
    ("clusters_per_group", 4, Field::Int),
    ("inodes_per_group", 4, Field::Int),
    ("mtime", 4, Field::Int),
    ("wtime", 4, Field::Int),
    ("mnt_count", 2, Field::Int),
    ("max_mnt_count", 2, Field::Int),
    ("magic", 2, Field::Int),
    ("state", 2, Field::Int),
    ("errors", 2, Field::Int),
    ("minor_rev_level", 2, Field::Int),
    ("lastcheck", 4, Field::Int),
    ("checkinterval", 4, Field::Int),
    ("creator_os", 4, Field::Int),
    ("rev_level", 4, Field::Int),
    ("def_resuid", 2, Field::Int),
    ("def_resgid", 2, Field::Int),
    ("first_ino", 4, Field::Int),
    ("inode_size", 2, Field::Int),
    ("block_group_nr", 2, Field::Int),
    ("feature_compat", 4, Field::Int),
    ("feature_incompat", 4, Field::Int),
    ("feature_ro_compat", 4, Field::Int),
    ("uuid", 16, Field::Bytes),
    ("volume_name", 16, Field::Text),
    ("last_mounted", 64, Field::Text),
    ("algorithm_usage_bitmap", 4, Field::Int),
    ("prealloc_blocks", 1, Field::Int),
    ("prealloc_dir_blocks", 1, Field::Int),
    ("reserved_gdt_blocks", 2, Field::Int),
    ("journal_uuid", 16, Field::Bytes),
    ("journal_inum", 4, Field::Int),
    ("journal_dev", 4, Field::Int),
    ("last_orphan", 4, Field::Int),
    ("hash_seed", 16, Field::Bytes),
    ("def_hash_version", 1, Field::Int),
    ("jnl_backup_type", 1, Field::Int),
    ("desc_size", 2, Field::Int),
    ("default_mount_opts", 4, Field::Int),
    ("first_meta_bg", 4, Field::Int),
    ("mkfs_time", 4, Field::Int),
    ("jnl_blocks", 68, Field::Bytes),
    ("blocks_count_hi", 4, Field::Int),
];

const GROUP_LAYOUT: &[(&str, usize)] = &[
    ("block_bitmap_lo", 4),
    ("inode_bitmap_lo", 4),
    ("inode_table_lo", 4),
    ("free_blocks_count_lo", 2),
    ("free_inodes_count_lo", 2),
    ("used_dirs_count_lo", 2),
    ("flags", 2),
    ("exclude_bitmap_lo", 4),
    ("block_bitmap_csum_lo", 2),
    ("inode_bitmap_csum_lo", 2),
    ("itable_unused_lo", 2),
    ("checksum", 2),
];

const GROUP_LAYOUT_64: &[(&str, usize)] = &[
    ("block_bitmap_hi", 4),
    ("inode_bitmap_hi", 4),
    ("inode_table_hi", 4),
];

/// ext2, ext3 and ext4 images
#[derive(Debug, Clone, Copy, Default)]
pub struct Ext4Parser;

impl FormatParser for Ext4Parser {
    fn name(&self) -> &'static str {
        "ext4"
    }

    fn archive_type(&self) -> &'static str {
        FORMAT
    }

    fn try_parse(&self, stream: &mut SubStream<'_>, ctx: &ParseContext<'_>) -> Result<Option<ArchiveTokenization>> {
        if stream.len() < SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE as u64 {
            return Ok(None);
        }
        let raw = stream::read_at(stream, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)?;
        if le_u16(&raw, 56) != MAGIC {
            return Ok(None);
        }
        let Some(geo) = Geometry::from_superblock(&raw) else {
            tracing::debug!("ext superblock magic with implausible geometry");
            return Ok(None);
        };
        let subtype = geo.subtype();

        if let Some(feature) = geo.unsupported_feature() {
            return Err(ArchiveError::Recoverable {
                format: FORMAT.into(),
                reason: format!("unsupported filesystem feature: {}", feature),
            });
        }
        if geo.image_len > stream.len() {
            return Err(ArchiveError::malformed(
                FORMAT,
                subtype,
                0,
                format!("image of {} bytes truncated to {}", geo.image_len, stream.len()),
            ));
        }

        tracing::debug!(
            subtype,
            block_size = geo.block_size,
            blocks = geo.blocks_count,
            blocks_per_group = geo.blocks_per_group,
            groups = geo.group_count,
            "ext filesystem superblock"
        );

        let image_len = geo.image_len;
        let mut image = Image { geo, subtype, groups: Vec::new(), regions: Vec::new() };
        image.claim_metadata(stream, ctx, &raw)?;
        image.claim_journal(stream, ctx)?;
        image.walk(stream, ctx)?;
        let mut tokens = image.into_tokens(stream, ctx)?;

        if let Some(trailing) = formats::trailing_leaf(stream, ctx, image_len)? {
            tokens.push(trailing);
        }
        formats::finish(stream, FORMAT, subtype, tokens).map(Some)
    }
}

/// Filesystem geometry taken from the superblock
#[derive(Debug, Clone)]
struct Geometry {
    block_size: u64,
    blocks_count: u64,
    first_data_block: u64,
    blocks_per_group: u64,
    inodes_per_group: u64,
    inodes_count: u64,
    inode_size: u64,
    desc_size: u64,
    group_count: u64,
    image_len: u64,
    compat: u32,
    incompat: u32,
    ro_compat: u32,
    journal_inum: u32,
}

impl Geometry {
    /// `None` when the numbers cannot describe a real filesystem
    fn from_superblock(raw: &[u8]) -> Option<Self> {
        let log_block_size = le_u32(raw, 24);
        if log_block_size > 6 {
            return None;
        }
        let block_size = 1024u64 << log_block_size;
        let compat = le_u32(raw, 92);
        let incompat = le_u32(raw, 96);
        let ro_compat = le_u32(raw, 100);
        let wide = incompat & INCOMPAT_64BIT != 0;

        let blocks_hi = if wide { u64::from(le_u32(raw, 0x150)) } else { 0 };
        let blocks_count = (blocks_hi << 32) | u64::from(le_u32(raw, 4));
        let first_data_block = u64::from(le_u32(raw, 20));
        let blocks_per_group = u64::from(le_u32(raw, 32));
        let inodes_per_group = u64::from(le_u32(raw, 40));
        let inode_size = if le_u32(raw, 76) == 0 { 128 } else { u64::from(le_u16(raw, 88)) };
        let desc_size = if wide { u64::from(le_u16(raw, 0xFE)) } else { 32 };

        let expected_first = u64::from(block_size == 1024);
        if first_data_block != expected_first
            || blocks_per_group == 0
            || inodes_per_group == 0
            || blocks_count <= first_data_block
            || inode_size < 128
            || !inode_size.is_power_of_two()
            || inode_size > block_size
            || !(32..=1024).contains(&desc_size)
            || !desc_size.is_power_of_two()
        {
            return None;
        }

        let group_count = (blocks_count - first_data_block).div_ceil(blocks_per_group);
        let image_len = blocks_count.checked_mul(block_size)?;

        Some(Self {
            block_size,
            blocks_count,
            first_data_block,
            blocks_per_group,
            inodes_per_group,
            inodes_count: u64::from(le_u32(raw, 0)),
            inode_size,
            desc_size,
            group_count,
            image_len,
            compat,
            incompat,
            ro_compat,
            journal_inum: le_u32(raw, 224),
        })
    }

    fn subtype(&self) -> &'static str {
        if self.incompat & INCOMPAT_EXT4 != 0 || self.ro_compat & RO_COMPAT_EXT4 != 0 {
            "ext4"
        } else if self.compat & COMPAT_HAS_JOURNAL != 0 {
            "ext3"
        } else {
            "ext2"
        }
    }

    fn unsupported_feature(&self) -> Option<&'static str> {
        if self.incompat & INCOMPAT_META_BG != 0 {
            Some("meta_bg")
        } else if self.incompat & INCOMPAT_JOURNAL_DEV != 0 {
            Some("journal_dev")
        } else if self.incompat & INCOMPAT_COMPRESSION != 0 {
            Some("compression")
        } else if self.ro_compat & RO_COMPAT_BIGALLOC != 0 {
            Some("bigalloc")
        } else {
            None
        }
    }

    fn has_journal(&self) -> bool {
        self.compat & COMPAT_HAS_JOURNAL != 0 && self.journal_inum != 0
    }
}

#[derive(Debug, Clone, Copy)]
struct GroupDesc {
    block_bitmap: u64,
    inode_bitmap: u64,
    inode_table: u64,
}

struct Inode {
    offset: u64,
    mode: u16,
    size: u64,
    flags: u32,
    block: [u8; 60],
}

impl Inode {
    fn decode(raw: &[u8], offset: u64) -> Self {
        let mut block = [0u8; 60];
        block.copy_from_slice(&raw[0x28..0x64]);
        Self {
            offset,
            mode: le_u16(raw, 0),
            size: (u64::from(le_u32(raw, 0x6C)) << 32) | u64::from(le_u32(raw, 4)),
            flags: le_u32(raw, 0x20),
            block,
        }
    }

    fn file_type(&self) -> u16 {
        self.mode & S_IFMT
    }

    fn uses_extents(&self) -> bool {
        self.flags & INODE_FLAG_EXTENTS != 0
    }

    fn has_inline_data(&self) -> bool {
        self.flags & INODE_FLAG_INLINE_DATA != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    logical: u64,
    physical: u64,
    len: u64,
    unwritten: bool,
}

/// Blocks owned by one inode
#[derive(Debug, Default)]
struct FileMap {
    extents: Vec<Extent>,
    /// Extent tree nodes or indirect blocks
    index_blocks: Vec<u64>,
}

/// Byte ranges holding a file's content, in file order
struct Pieces {
    ranges: Vec<(u64, u64)>,
    /// Content is not one gap-free run (holes or unwritten extents)
    sparse: bool,
}

fn fragment_name(path: &str, index: usize) -> String {
    if index == 0 {
        path.to_string()
    } else {
        format!("{}#{}", path, index)
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

fn superblock_token(raw: &[u8]) -> Token {
    let mut h = HeaderFields::new(raw, SUPERBLOCK_OFFSET);
    for &(name, len, field) in SUPERBLOCK_LAYOUT {
        match field {
            Field::Int => {
                h.le(name, len);
            }
            Field::Text => {
                h.text(name, len);
            }
            Field::Bytes => h.bytes(name, len),
        }
    }
    h.finish("superblock")
}

fn decode_group(raw: &[u8], base: u64, index: u64, wide: bool) -> (GroupDesc, Token) {
    let hi = |at: usize| if wide { u64::from(le_u32(raw, at)) << 32 } else { 0 };
    let group = GroupDesc {
        block_bitmap: hi(0x20) | u64::from(le_u32(raw, 0)),
        inode_bitmap: hi(0x24) | u64::from(le_u32(raw, 4)),
        inode_table: hi(0x28) | u64::from(le_u32(raw, 8)),
    };

    let mut h = HeaderFields::new(raw, base);
    for &(name, len) in GROUP_LAYOUT {
        h.le(name, len);
    }
    if wide {
        for &(name, len) in GROUP_LAYOUT_64 {
            h.le(name, len);
        }
    }
    (group, h.finish(format!("group-{}", index)))
}

/// Parse one block of directory entries into `(inode, name)` pairs
fn read_dirents(block: &[u8], base: u64, out: &mut Vec<(u32, String)>) -> std::result::Result<(), (u64, String)> {
    let mut pos = 0usize;
    while pos + 8 <= block.len() {
        let inode = le_u32(block, pos);
        let rec_len = match le_u16(block, pos + 4) {
            // 64 KiB blocks encode a full-block record specially
            0 | 65535 if block.len() >= 65536 => block.len() - pos,
            n => usize::from(n),
        };
        let name_len = usize::from(block[pos + 6]);
        if rec_len < 8 || pos + rec_len > block.len() || 8 + name_len > rec_len {
            return Err((base + pos as u64, format!("corrupt directory entry (rec_len {})", rec_len)));
        }
        if inode != 0 && name_len > 0 {
            let name = &block[pos + 8..pos + 8 + name_len];
            if name != b"." && name != b".." {
                out.push((inode, String::from_utf8_lossy(name).into_owned()));
            }
        }
        pos += rec_len;
    }
    Ok(())
}

/// Merge consecutive `(logical, physical)` block pairs into extents
fn coalesce(blocks: &[(u64, u64)]) -> Vec<Extent> {
    let mut extents: Vec<Extent> = Vec::new();
    for &(logical, physical) in blocks {
        if let Some(last) = extents.last_mut() {
            if last.logical + last.len == logical && last.physical + last.len == physical {
                last.len += 1;
                continue;
            }
        }
        extents.push(Extent { logical, physical, len: 1, unwritten: false });
    }
    extents
}

/// Parsing state for one image
struct Image {
    geo: Geometry,
    subtype: &'static str,
    groups: Vec<GroupDesc>,
    /// Claimed regions, unordered until `into_tokens`
    regions: Vec<Token>,
}

impl Image {
    fn malformed(&self, offset: u64, reason: impl Into<String>) -> ArchiveError {
        ArchiveError::malformed(FORMAT, self.subtype, offset, reason)
    }

    fn read(&self, stream: &mut SubStream<'_>, offset: u64, len: u64) -> Result<Vec<u8>> {
        let len = usize::try_from(len).map_err(|_| self.malformed(offset, "region too large to read"))?;
        stream::read_at(stream, offset, len).map_err(|e| formats::committed_io(e, FORMAT, self.subtype, offset))
    }

    /// Byte offset of `count` blocks starting at `block`, checked against the image
    fn blocks_at(&self, block: u64, count: u64, what: &str) -> Result<u64> {
        match block.checked_add(count) {
            Some(end) if end <= self.geo.blocks_count => Ok(block * self.geo.block_size),
            _ => Err(self.malformed(
                block.saturating_mul(self.geo.block_size),
                format!("{} at block {} (+{}) lies outside the image", what, block, count),
            )),
        }
    }

    fn claim_content(
        &mut self,
        stream: &mut SubStream<'_>,
        ctx: &ParseContext<'_>,
        name: String,
        offset: u64,
        len: u64,
    ) -> Result<()> {
        let token = formats::content_leaf(stream, ctx, TokenKind::Region, name, offset, len)?;
        self.regions.push(token);
        Ok(())
    }

    fn claim_metadata(&mut self, stream: &mut SubStream<'_>, ctx: &ParseContext<'_>, superblock: &[u8]) -> Result<()> {
        let bs = self.geo.block_size;
        self.claim_content(stream, ctx, "boot-area".into(), 0, SUPERBLOCK_OFFSET)?;
        self.regions.push(superblock_token(superblock));

        let gdt_len = self.geo.group_count * self.geo.desc_size;
        let gdt_blocks = gdt_len.div_ceil(bs);
        let gdt_offset = self.blocks_at(self.geo.first_data_block + 1, gdt_blocks, "group descriptor table")?;
        let raw = self.read(stream, gdt_offset, gdt_len)?;

        let desc_size = self.geo.desc_size as usize;
        let wide = self.geo.desc_size >= 64;
        let mut descriptors = Vec::with_capacity(self.geo.group_count as usize);
        for (index, desc) in raw.chunks_exact(desc_size).enumerate() {
            let base = gdt_offset + (index * desc_size) as u64;
            let (group, token) = decode_group(desc, base, index as u64, wide);
            self.groups.push(group);
            descriptors.push(token);
        }
        self.regions.push(Token::group(TokenKind::Region, "group-descriptors", descriptors));

        let table_len = self.geo.inodes_per_group * self.geo.inode_size;
        for (index, group) in self.groups.clone().into_iter().enumerate() {
            let offset = self.blocks_at(group.block_bitmap, 1, "block bitmap")?;
            self.claim_content(stream, ctx, format!("block-bitmap-{}", index), offset, bs)?;

            let offset = self.blocks_at(group.inode_bitmap, 1, "inode bitmap")?;
            self.claim_content(stream, ctx, format!("inode-bitmap-{}", index), offset, bs)?;

            let offset = self.blocks_at(group.inode_table, table_len.div_ceil(bs), "inode table")?;
            self.claim_content(stream, ctx, format!("inode-table-{}", index), offset, table_len)?;
        }
        Ok(())
    }

    fn read_inode(&self, stream: &mut SubStream<'_>, number: u32) -> Result<Inode> {
        let index = u64::from(number).wrapping_sub(1);
        if number == 0 || u64::from(number) > self.geo.inodes_count {
            return Err(self.malformed(0, format!("inode number {} out of range", number)));
        }
        let group = (index / self.geo.inodes_per_group) as usize;
        let slot = index % self.geo.inodes_per_group;
        let table = self
            .groups
            .get(group)
            .ok_or_else(|| self.malformed(0, format!("inode {} belongs to missing group {}", number, group)))?
            .inode_table;
        let offset = table * self.geo.block_size + slot * self.geo.inode_size;
        let raw = self.read(stream, offset, 128)?;
        Ok(Inode::decode(&raw, offset))
    }

    fn extent_node(
        &self,
        stream: &mut SubStream<'_>,
        node: &[u8],
        node_offset: u64,
        expected_depth: Option<u16>,
        owner: &str,
        map: &mut FileMap,
    ) -> Result<()> {
        if node.len() < 12 || le_u16(node, 0) != EXTENT_MAGIC {
            return Err(self.malformed(node_offset, format!("{}: bad extent header", owner)));
        }
        let entries = usize::from(le_u16(node, 2));
        let depth = le_u16(node, 6);
        if depth > MAX_EXTENT_DEPTH || expected_depth.is_some_and(|d| d != depth) || 12 + 12 * entries > node.len() {
            return Err(self.malformed(
                node_offset,
                format!("{}: inconsistent extent node (depth {}, {} entries)", owner, depth, entries),
            ));
        }

        for entry in node[12..12 + 12 * entries].chunks_exact(12) {
            if depth == 0 {
                let raw_len = le_u16(entry, 4);
                let (len, unwritten) = if raw_len > EXTENT_INIT_MAX_LEN {
                    (raw_len - EXTENT_INIT_MAX_LEN, true)
                } else {
                    (raw_len, false)
                };
                map.extents.push(Extent {
                    logical: u64::from(le_u32(entry, 0)),
                    physical: (u64::from(le_u16(entry, 6)) << 32) | u64::from(le_u32(entry, 8)),
                    len: u64::from(len),
                    unwritten,
                });
            } else {
                let leaf = (u64::from(le_u16(entry, 8)) << 32) | u64::from(le_u32(entry, 4));
                let offset = self.blocks_at(leaf, 1, "extent index block")?;
                map.index_blocks.push(leaf);
                let child = self.read(stream, offset, self.geo.block_size)?;
                self.extent_node(stream, &child, offset, Some(depth - 1), owner, map)?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn indirect(
        &self,
        stream: &mut SubStream<'_>,
        block: u32,
        level: u32,
        nblocks: u64,
        logical: &mut u64,
        blocks: &mut Vec<(u64, u64)>,
        map: &mut FileMap,
    ) -> Result<()> {
        let per_block = self.geo.block_size / 4;
        if block == 0 {
            *logical += per_block.pow(level);
            return Ok(());
        }
        let offset = self.blocks_at(u64::from(block), 1, "indirect block")?;
        map.index_blocks.push(u64::from(block));
        if map.index_blocks.len() as u64 + blocks.len() as u64 > self.geo.blocks_count {
            return Err(self.malformed(offset, "block map references more blocks than the image holds"));
        }
        let raw = self.read(stream, offset, self.geo.block_size)?;
        for pointer in raw.chunks_exact(4) {
            if *logical >= nblocks {
                break;
            }
            let target = le_u32(pointer, 0);
            if level == 1 {
                if target != 0 {
                    blocks.push((*logical, u64::from(target)));
                }
                *logical += 1;
            } else {
                self.indirect(stream, target, level - 1, nblocks, logical, blocks, map)?;
            }
        }
        Ok(())
    }

    /// Direct, indirect, double and triple indirect block pointers
    fn block_map(&self, stream: &mut SubStream<'_>, i_block: &[u8], nblocks: u64, map: &mut FileMap) -> Result<()> {
        let mut blocks = Vec::new();
        let mut logical = 0u64;
        for pointer in i_block[..48].chunks_exact(4) {
            if logical >= nblocks {
                break;
            }
            let target = le_u32(pointer, 0);
            if target != 0 {
                blocks.push((logical, u64::from(target)));
            }
            logical += 1;
        }
        for level in 1..=3u32 {
            if logical >= nblocks {
                break;
            }
            let at = 48 + 4 * (level as usize - 1);
            self.indirect(stream, le_u32(i_block, at), level, nblocks, &mut logical, &mut blocks, map)?;
        }
        map.extents.extend(coalesce(&blocks));
        Ok(())
    }

    fn file_map(&self, stream: &mut SubStream<'_>, inode: &Inode, owner: &str) -> Result<FileMap> {
        let mut map = FileMap::default();
        if inode.uses_extents() {
            self.extent_node(stream, &inode.block, inode.offset + 0x28, None, owner, &mut map)?;
        } else {
            let nblocks = inode.size.div_ceil(self.geo.block_size);
            self.block_map(stream, &inode.block, nblocks, &mut map)?;
        }
        Ok(map)
    }

    /// Byte ranges holding the first `size` bytes of a file
    fn pieces(&self, map: &FileMap, size: u64, owner: &str) -> Result<Pieces> {
        let bs = self.geo.block_size;
        let mut extents = map.extents.clone();
        extents.sort_by_key(|e| e.logical);

        let mut ranges = Vec::new();
        let mut covered = 0u64;
        let mut sparse = false;
        for extent in extents {
            let start = extent.logical * bs;
            if start >= size {
                continue;
            }
            if extent.unwritten {
                sparse = true;
                continue;
            }
            if start != covered {
                sparse = true;
            }
            let offset = self.blocks_at(extent.physical, extent.len, owner)?;
            let len = (extent.len * bs).min(size - start);
            ranges.push((offset, len));
            covered = start + len;
        }
        if covered < size {
            sparse = true;
        }
        Ok(Pieces { ranges, sparse })
    }

    fn claim_index_blocks(&mut self, stream: &mut SubStream<'_>, ctx: &ParseContext<'_>, map: &FileMap, owner: &str) -> Result<()> {
        let bs = self.geo.block_size;
        for &block in &map.index_blocks {
            self.claim_content(stream, ctx, format!("{}#index", owner), block * bs, bs)?;
        }
        Ok(())
    }

    fn claim_journal(&mut self, stream: &mut SubStream<'_>, ctx: &ParseContext<'_>) -> Result<()> {
        if !self.geo.has_journal() {
            return Ok(());
        }
        let inode = self.read_inode(stream, self.geo.journal_inum)?;
        let map = self.file_map(stream, &inode, "journal")?;
        self.claim_index_blocks(stream, ctx, &map, "journal")?;
        let pieces = self.pieces(&map, inode.size, "journal")?;
        for (index, &(offset, len)) in pieces.ranges.iter().enumerate() {
            self.claim_content(stream, ctx, fragment_name("journal", index), offset, len)?;
        }
        Ok(())
    }

    /// Visit every inode reachable from the root directory
    fn walk(&mut self, stream: &mut SubStream<'_>, ctx: &ParseContext<'_>) -> Result<()> {
        let mut visited = HashSet::new();
        if self.geo.has_journal() {
            visited.insert(self.geo.journal_inum);
        }
        let mut pending = vec![(ROOT_INODE, String::from("/"))];

        while let Some((number, path)) = pending.pop() {
            ctx.check_cancelled()?;
            if !visited.insert(number) {
                continue;
            }
            let inode = self.read_inode(stream, number)?;
            match inode.file_type() {
                S_IFDIR => {
                    let entries = self.directory(stream, ctx, &inode, &path)?;
                    for (child, name) in entries.into_iter().rev() {
                        pending.push((child, child_path(&path, &name)));
                    }
                }
                S_IFREG => self.file(stream, ctx, &inode, &path)?,
                S_IFLNK if !inode.has_inline_data() && (inode.size >= FAST_SYMLINK_MAX || inode.uses_extents()) => {
                    self.symlink(stream, ctx, &inode, &path)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn directory(
        &mut self,
        stream: &mut SubStream<'_>,
        ctx: &ParseContext<'_>,
        inode: &Inode,
        path: &str,
    ) -> Result<Vec<(u32, String)>> {
        let mut entries = Vec::new();
        if inode.has_inline_data() {
            // The first four bytes hold the parent inode
            read_dirents(&inode.block[4..], inode.offset + 0x2C, &mut entries)
                .map_err(|(offset, reason)| self.malformed(offset, format!("{}: {}", path, reason)))?;
            return Ok(entries);
        }

        let map = self.file_map(stream, inode, path)?;
        self.claim_index_blocks(stream, ctx, &map, path)?;
        let pieces = self.pieces(&map, inode.size, path)?;
        let bs = self.geo.block_size as usize;
        for (index, &(offset, len)) in pieces.ranges.iter().enumerate() {
            self.claim_content(stream, ctx, fragment_name(path, index), offset, len)?;
            let data = self.read(stream, offset, len)?;
            for (block_index, block) in data.chunks(bs).enumerate() {
                read_dirents(block, offset + (block_index * bs) as u64, &mut entries)
                    .map_err(|(at, reason)| self.malformed(at, format!("{}: {}", path, reason)))?;
            }
        }
        Ok(entries)
    }

    fn file(&mut self, stream: &mut SubStream<'_>, ctx: &ParseContext<'_>, inode: &Inode, path: &str) -> Result<()> {
        if inode.has_inline_data() || inode.size == 0 {
            return Ok(());
        }
        let map = self.file_map(stream, inode, path)?;
        self.claim_index_blocks(stream, ctx, &map, path)?;
        let pieces = self.pieces(&map, inode.size, path)?;

        match pieces.ranges.as_slice() {
            [] => Ok(()),
            [(offset, len)] if !pieces.sparse => {
                let token = formats::payload_leaf(stream, ctx, path, *offset, *len)?;
                self.regions.push(token);
                Ok(())
            }
            ranges => self.fragmented(stream, ctx, path, ranges, pieces.sparse),
        }
    }

    fn fragmented(
        &mut self,
        stream: &mut SubStream<'_>,
        ctx: &ParseContext<'_>,
        path: &str,
        ranges: &[(u64, u64)],
        sparse: bool,
    ) -> Result<()> {
        let mut tokens = Vec::with_capacity(ranges.len());
        for (index, &(offset, len)) in ranges.iter().enumerate() {
            tokens.push(formats::content_leaf(stream, ctx, TokenKind::Payload, fragment_name(path, index), offset, len)?);
        }

        if let Some(wanted) = ctx.nested_type_for(path) {
            if sparse {
                tracing::debug!(file = path, "sparse file, nested detection skipped");
            } else {
                let mut file = scratch::materialize(ctx.scratch(), stream, ranges)?;
                let types: Vec<&str> = wanted.into_iter().collect();
                if let Some(nested) = ctx.detect_in_entry(path, &mut file, None, &types)? {
                    tracing::info!(
                        entry = path,
                        archive_type = nested.archive_type(),
                        fragments = ranges.len(),
                        "attached nested archive from fragmented file"
                    );
                    tokens[0].nested = Some(Box::new(nested));
                }
            }
        }

        self.regions.extend(tokens);
        Ok(())
    }

    fn symlink(&mut self, stream: &mut SubStream<'_>, ctx: &ParseContext<'_>, inode: &Inode, path: &str) -> Result<()> {
        let map = self.file_map(stream, inode, path)?;
        self.claim_index_blocks(stream, ctx, &map, path)?;
        let pieces = self.pieces(&map, inode.size, path)?;
        for (index, &(offset, len)) in pieces.ranges.iter().enumerate() {
            self.claim_content(stream, ctx, fragment_name(path, index), offset, len)?;
        }
        Ok(())
    }

    /// Sort the claimed regions and fill the space between them with gaps
    fn into_tokens(self, stream: &mut SubStream<'_>, ctx: &ParseContext<'_>) -> Result<Vec<Token>> {
        let Image { geo, subtype, mut regions, .. } = self;
        regions.sort_by_key(|t| t.span.map_or(0, |s| s.offset));

        let mut tokens = Vec::with_capacity(regions.len() * 2 + 1);
        let mut cursor = 0u64;
        let mut previous = String::new();
        for token in regions {
            let Some(span) = token.span else {
                continue;
            };
            if span.end() > geo.image_len {
                return Err(ArchiveError::malformed(
                    FORMAT,
                    subtype,
                    span.offset,
                    format!("{} lies outside the image", token.name),
                ));
            }
            if span.offset < cursor {
                return Err(ArchiveError::malformed(
                    FORMAT,
                    subtype,
                    span.offset,
                    format!("{} overlaps {}", token.name, previous),
                ));
            }
            if span.offset > cursor {
                tokens.push(formats::content_leaf(stream, ctx, TokenKind::Gap, "unused", cursor, span.offset - cursor)?);
            }
            cursor = span.end();
            previous.clone_from(&token.name);
            tokens.push(token);
        }
        if cursor < geo.image_len {
            tokens.push(formats::content_leaf(stream, ctx, TokenKind::Gap, "unused", cursor, geo.image_len - cursor)?);
        }
        Ok(tokens)
    }
}
