//! FAT32 filesystem driver.
//!
//! Full read/write support directly on a [`BlockDevice`]: boot-sector
//! and FSInfo parsing, cluster-chain walking and mutation, 8.3
//! directory entries, whole-file read/write/create/delete, and volume
//! formatting.
//!
//! Layout recap:
//! - Boot sector (sector 0) with the BPB, plus a backup copy
//! - FSInfo sector with advisory free-cluster accounting
//! - FAT copies (usually 2)
//! - Data region, addressed in clusters starting at 2

use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::config::{CHUNK_SIZE_FOR_FILL, SECTOR_SIZE};
use crate::vfs::{BlockDevice, FsError};

/// FAT entry values (28-bit space; the high 4 bits are reserved).
const FAT_FREE: u32 = 0;
const FAT_EOC_MIN: u32 = 0x0FFF_FFF8;
const FAT_EOC: u32 = 0x0FFF_FFFF;
const FAT_ENTRY_MASK: u32 = 0x0FFF_FFFF;

/// FSInfo signatures and field offsets
const FSINFO_LEAD_SIG: u32 = 0x4161_5252;
const FSINFO_STRUCT_SIG: u32 = 0x6141_7272;
const FSINFO_TRAIL_SIG: u32 = 0xAA55_0000;
const FSINFO_UNKNOWN: u32 = 0xFFFF_FFFF;
const FSINFO_OFF_LEAD: usize = 0;
const FSINFO_OFF_STRUCT: usize = 484;
const FSINFO_OFF_FREE_COUNT: usize = 488;
const FSINFO_OFF_NEXT_FREE: usize = 492;
const FSINFO_OFF_TRAIL: usize = 508;

/// Directory entry attributes
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
const ATTR_LONG_NAME: u8 = 0x0F;

/// Directory entry first-byte markers
const ENTRY_END: u8 = 0x00;
const ENTRY_DELETED: u8 = 0xE5;
const ENTRY_KANJI_E5: u8 = 0x05;

const DIR_ENTRY_SIZE: usize = 32;

/// Format constants
const RESERVED_SECTORS: u16 = 32;
const FAT_COUNT: u8 = 2;
const MEDIA_DESCRIPTOR: u8 = 0xF8;
const ROOT_CLUSTER: u32 = 2;
const FSINFO_SECTOR: u16 = 1;
const BACKUP_BOOT_SECTOR: u16 = 6;

/// Deterministic placeholders stamped into new entries and fresh
/// volumes, so repeated formats are byte-identical.
const DEFAULT_TIME: u16 = (10 << 11) | (30 << 5); // 10:30:00
const DEFAULT_DATE: u16 = ((2025 - 1980) << 9) | (4 << 5) | 18; // 2025-04-18
const DEFAULT_VOLUME_ID: u32 = 0x1234_5678;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

// ============================================================================
// Little-endian field access
// ============================================================================

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn write_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

// ============================================================================
// On-disk records
// ============================================================================

/// A normalized 8.3 short name: 8 name bytes and 3 extension bytes,
/// space padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortName {
    name: [u8; 8],
    ext: [u8; 3],
}

impl ShortName {
    const DOT: Self = Self {
        name: [b'.', b' ', b' ', b' ', b' ', b' ', b' ', b' '],
        ext: [b' '; 3],
    };
    const DOT_DOT: Self = Self {
        name: [b'.', b'.', b' ', b' ', b' ', b' ', b' ', b' '],
        ext: [b' '; 3],
    };

    /// Split at the last dot; up to 8 basename and 3 extension bytes.
    ///
    /// No case folding happens here: callers supply upper-case names.
    pub fn normalize(filename: &str) -> Result<Self, FsError> {
        if filename.is_empty() {
            return Err(FsError::BadParameter);
        }
        let bytes = filename.as_bytes();
        let (base, ext): (&[u8], &[u8]) = match filename.rfind('.') {
            Some(pos) => (&bytes[..pos], &bytes[pos + 1..]),
            None => (bytes, &[]),
        };

        let mut name_field = [b' '; 8];
        for (i, &b) in base.iter().take(8).enumerate() {
            name_field[i] = b;
        }
        let mut ext_field = [b' '; 3];
        for (i, &b) in ext.iter().take(3).enumerate() {
            ext_field[i] = b;
        }
        Ok(Self { name: name_field, ext: ext_field })
    }

    fn matches(&self, entry: &RawDirEntry) -> bool {
        entry.0[0..8] == self.name && entry.0[8..11] == self.ext
    }
}

/// One 32-byte directory entry, manipulated in place.
#[derive(Clone, Copy)]
struct RawDirEntry([u8; DIR_ENTRY_SIZE]);

impl RawDirEntry {
    fn from_slice(bytes: &[u8]) -> Self {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw.copy_from_slice(&bytes[..DIR_ENTRY_SIZE]);
        Self(raw)
    }

    fn is_end(&self) -> bool {
        self.0[0] == ENTRY_END
    }

    fn is_deleted(&self) -> bool {
        self.0[0] == ENTRY_DELETED
    }

    fn attributes(&self) -> u8 {
        self.0[11]
    }

    fn is_long_name(&self) -> bool {
        self.attributes() & ATTR_LONG_NAME == ATTR_LONG_NAME
    }

    fn is_volume_label(&self) -> bool {
        self.attributes() & ATTR_VOLUME_ID != 0 && !self.is_long_name()
    }

    fn is_directory(&self) -> bool {
        self.attributes() & ATTR_DIRECTORY != 0
    }

    fn first_cluster(&self) -> u32 {
        ((read_u16(&self.0, 20) as u32) << 16) | read_u16(&self.0, 26) as u32
    }

    fn file_size(&self) -> u32 {
        read_u32(&self.0, 28)
    }

    fn set_first_cluster(&mut self, cluster: u32) {
        write_u16(&mut self.0, 20, (cluster >> 16) as u16);
        write_u16(&mut self.0, 26, cluster as u16);
    }

    fn set_file_size(&mut self, size: u32) {
        write_u32(&mut self.0, 28, size);
    }

    /// A fresh entry with the deterministic placeholder stamps.
    fn new_entry(name: &ShortName, attributes: u8, first_cluster: u32, size: u32) -> Self {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[0..8].copy_from_slice(&name.name);
        raw[8..11].copy_from_slice(&name.ext);
        raw[11] = attributes;
        write_u16(&mut raw, 14, DEFAULT_TIME); // creation time
        write_u16(&mut raw, 16, DEFAULT_DATE); // creation date
        write_u16(&mut raw, 18, DEFAULT_DATE); // access date
        write_u16(&mut raw, 22, DEFAULT_TIME); // modification time
        write_u16(&mut raw, 24, DEFAULT_DATE); // modification date
        let mut entry = Self(raw);
        entry.set_first_cluster(first_cluster);
        entry.set_file_size(size);
        entry
    }

    /// The volume-label entry written into a fresh root directory.
    /// Dots are skipped positionally, like the BPB label field.
    fn volume_label(label: &str) -> Self {
        let mut field = [b' '; 11];
        for (i, &b) in label.as_bytes().iter().take(11).enumerate() {
            if b != b'.' {
                field[i] = b;
            }
        }
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[..11].copy_from_slice(&field);
        raw[11] = ATTR_VOLUME_ID;
        write_u16(&mut raw, 14, DEFAULT_TIME);
        write_u16(&mut raw, 16, DEFAULT_DATE);
        write_u16(&mut raw, 18, DEFAULT_DATE);
        write_u16(&mut raw, 22, DEFAULT_TIME);
        write_u16(&mut raw, 24, DEFAULT_DATE);
        Self(raw)
    }

    /// "NAME.EXT" form, with the 0x05 first-byte substitution.
    fn display_name(&self) -> String {
        let mut name = String::new();
        for (i, &b) in self.0[..8].iter().enumerate() {
            let b = if i == 0 && b == ENTRY_KANJI_E5 { ENTRY_DELETED } else { b };
            if b == b' ' {
                break;
            }
            name.push(b as char);
        }
        let ext: String = self.0[8..11]
            .iter()
            .take_while(|&&b| b != b' ')
            .map(|&b| b as char)
            .collect();
        if ext.is_empty() {
            name
        } else {
            format!("{}.{}", name, ext)
        }
    }
}

/// One listing row from a directory scan.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub attributes: u8,
    pub first_cluster: u32,
    pub size: u32,
    pub is_directory: bool,
    pub is_volume_label: bool,
}

// ============================================================================
// Geometry and advisory state
// ============================================================================

/// Volume geometry, derived once from the boot sector and immutable for
/// the life of the mount.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    sectors_per_cluster: u8,
    reserved_sectors: u16,
    fat_count: u8,
    sectors_per_fat: u32,
    root_cluster: u32,
    fsinfo_sector: u16,
    total_sectors: u64,
    total_clusters: u32,
    data_start_sector: u64,
    bytes_per_cluster: usize,
}

fn parse_boot_sector(sector: &[u8], device_sectors: u64) -> Result<Geometry, FsError> {
    if read_u16(sector, 510) != 0xAA55 {
        log::warn!("[FAT32] missing boot signature");
        return Err(FsError::CorruptMetadata);
    }

    let bytes_per_sector = read_u16(sector, 11);
    if bytes_per_sector as usize != SECTOR_SIZE {
        log::warn!("[FAT32] unsupported sector size {}", bytes_per_sector);
        return Err(FsError::CorruptMetadata);
    }

    let sectors_per_cluster = sector[13];
    if sectors_per_cluster == 0 {
        log::warn!("[FAT32] sectors-per-cluster is zero");
        return Err(FsError::CorruptMetadata);
    }

    let reserved_sectors = read_u16(sector, 14);
    let fat_count = sector[16];
    if reserved_sectors == 0 || fat_count == 0 {
        log::warn!("[FAT32] implausible reserved/FAT counts");
        return Err(FsError::CorruptMetadata);
    }

    let fat_size_16 = read_u16(sector, 22);
    let sectors_per_fat = if fat_size_16 != 0 { fat_size_16 as u32 } else { read_u32(sector, 36) };
    if sectors_per_fat == 0 {
        log::warn!("[FAT32] FAT size is zero");
        return Err(FsError::CorruptMetadata);
    }

    let total_16 = read_u16(sector, 19);
    let total_sectors = if total_16 != 0 { total_16 as u64 } else { read_u32(sector, 32) as u64 };

    let data_start_sector = reserved_sectors as u64 + fat_count as u64 * sectors_per_fat as u64;
    if total_sectors <= data_start_sector {
        log::warn!("[FAT32] no data region");
        return Err(FsError::CorruptMetadata);
    }
    if device_sectors != 0 && total_sectors > device_sectors {
        log::warn!(
            "[FAT32] volume claims {} sectors on a {}-sector device",
            total_sectors,
            device_sectors
        );
    }

    let data_sectors = total_sectors - data_start_sector;
    let total_clusters = (data_sectors / sectors_per_cluster as u64) as u32;
    if total_clusters < 65525 {
        // FAT16-sized volume; mountable here but out of contract.
        log::warn!("[FAT32] only {} clusters, volume looks like FAT16", total_clusters);
    }

    Ok(Geometry {
        sectors_per_cluster,
        reserved_sectors,
        fat_count,
        sectors_per_fat,
        root_cluster: read_u32(sector, 44),
        fsinfo_sector: read_u16(sector, 48),
        total_sectors,
        total_clusters,
        data_start_sector,
        bytes_per_cluster: sectors_per_cluster as usize * SECTOR_SIZE,
    })
}

/// Cached FSInfo state. Advisory only: the FAT stays authoritative, and
/// invalid signatures mean "unknown", never values to resynthesize.
#[derive(Debug, Clone, Copy)]
struct FsInfoState {
    valid: bool,
    free_count: u32,
    next_free: u32,
}

impl FsInfoState {
    const UNKNOWN: Self = Self { valid: false, free_count: FSINFO_UNKNOWN, next_free: 2 };
}

fn fsinfo_signatures_ok(sector: &[u8]) -> bool {
    read_u32(sector, FSINFO_OFF_LEAD) == FSINFO_LEAD_SIG
        && read_u32(sector, FSINFO_OFF_STRUCT) == FSINFO_STRUCT_SIG
        && read_u32(sector, FSINFO_OFF_TRAIL) == FSINFO_TRAIL_SIG
}

fn load_fsinfo<D: BlockDevice>(dev: &mut D, geo: &Geometry) -> FsInfoState {
    let sector_no = geo.fsinfo_sector;
    if sector_no == 0 || sector_no >= geo.reserved_sectors {
        log::warn!("[FAT32] FSInfo sector {} outside the reserved region", sector_no);
        return FsInfoState::UNKNOWN;
    }

    let mut sector = [0u8; SECTOR_SIZE];
    if dev.block_read(sector_no as u64, 1, &mut sector).is_err() {
        log::warn!("[FAT32] FSInfo read failed");
        return FsInfoState::UNKNOWN;
    }
    if !fsinfo_signatures_ok(&sector) {
        log::warn!("[FAT32] invalid FSInfo signatures; free count unknown");
        return FsInfoState::UNKNOWN;
    }

    FsInfoState {
        valid: true,
        free_count: read_u32(&sector, FSINFO_OFF_FREE_COUNT),
        next_free: read_u32(&sector, FSINFO_OFF_NEXT_FREE),
    }
}

// ============================================================================
// The volume
// ============================================================================

/// Where a directory entry lives on disk.
#[derive(Debug, Clone, Copy)]
struct EntrySlot {
    cluster: u32,
    index: usize,
}

/// Result of one pass over a directory chain.
struct DirScan {
    found: Option<(EntrySlot, RawDirEntry)>,
    free_slot: Option<EntrySlot>,
    last_cluster: u32,
}

/// A mounted FAT32 volume owning its device handle and one
/// cluster-sized scratch buffer.
///
/// Not re-entrant: every operation stages directory clusters and file
/// data through the scratch buffer.
#[derive(Debug)]
pub struct Fat32Volume<D: BlockDevice> {
    dev: D,
    geo: Geometry,
    fsinfo: FsInfoState,
    scratch: Vec<u8>,
}

impl<D: BlockDevice> Fat32Volume<D> {
    /// Mount a volume from sector 0 of `dev`.
    pub fn mount(mut dev: D) -> Result<Self, FsError> {
        let mut sector = [0u8; SECTOR_SIZE];
        dev.block_read(0, 1, &mut sector)?;

        let geo = parse_boot_sector(&sector, dev.sector_count())?;
        let fsinfo = load_fsinfo(&mut dev, &geo);
        let scratch = vec![0u8; geo.bytes_per_cluster];

        log::debug!(
            "[FAT32] mounted: {} sectors/cluster, {} clusters, root cluster {}",
            geo.sectors_per_cluster,
            geo.total_clusters,
            geo.root_cluster
        );

        Ok(Self { dev, geo, fsinfo, scratch })
    }

    /// Format `dev` as FAT32 and mount the result.
    pub fn format(mut dev: D, total_sectors: u64, label: &str) -> Result<Self, FsError> {
        format_volume(&mut dev, total_sectors, label)?;
        Self::mount(dev)
    }

    pub fn root_cluster(&self) -> u32 {
        self.geo.root_cluster
    }

    pub fn total_clusters(&self) -> u32 {
        self.geo.total_clusters
    }

    pub fn total_sectors(&self) -> u64 {
        self.geo.total_sectors
    }

    pub fn bytes_per_cluster(&self) -> usize {
        self.geo.bytes_per_cluster
    }

    /// Direct device access, for embedders layering other tooling on
    /// the same disk.
    pub fn device(&mut self) -> &mut D {
        &mut self.dev
    }

    pub fn into_device(self) -> D {
        self.dev
    }

    // ------------------------------------------------------------------
    // Cluster arithmetic and FAT access
    // ------------------------------------------------------------------

    /// First LBA of a cluster; defined only for `cluster >= 2`.
    pub(crate) fn cluster_to_lba(&self, cluster: u32) -> u64 {
        debug_assert!(cluster >= 2);
        self.geo.data_start_sector
            + (cluster as u64 - 2) * self.geo.sectors_per_cluster as u64
    }

    fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster < self.geo.total_clusters + 2
    }

    /// FAT sector and byte offset holding `cluster`'s entry.
    pub(crate) fn fat_location(&self, cluster: u32) -> (u64, usize) {
        let byte_offset = cluster as u64 * 4;
        (
            self.geo.reserved_sectors as u64 + byte_offset / SECTOR_SIZE as u64,
            (byte_offset % SECTOR_SIZE as u64) as usize,
        )
    }

    /// 28-bit FAT entry for `cluster`.
    pub(crate) fn read_fat_entry(&mut self, cluster: u32) -> Result<u32, FsError> {
        let (lba, off) = self.fat_location(cluster);
        let mut sector = [0u8; SECTOR_SIZE];
        self.dev.block_read(lba, 1, &mut sector)?;
        Ok(read_u32(&sector, off) & FAT_ENTRY_MASK)
    }

    /// Next link in a chain. A free or otherwise impossible link mid-
    /// chain is corruption; it is reported and collapsed to end-of-chain.
    pub(crate) fn next_cluster(&mut self, cluster: u32) -> Result<u32, FsError> {
        let entry = self.read_fat_entry(cluster)?;
        if entry >= FAT_EOC_MIN {
            return Ok(entry);
        }
        if !self.is_valid_cluster(entry) {
            log::warn!(
                "[FAT32] corrupt FAT link {:#x} after cluster {}; treating as end of chain",
                entry,
                cluster
            );
            return Ok(FAT_EOC);
        }
        Ok(entry)
    }

    /// Read-modify-write `cluster`'s FAT entry, preserving the reserved
    /// high 4 bits, and mirror the sector to every backup FAT. A mirror
    /// failure is a warning, not an error.
    pub(crate) fn update_fat_entry(&mut self, cluster: u32, value: u32) -> Result<(), FsError> {
        if !self.is_valid_cluster(cluster) {
            return Err(FsError::BadParameter);
        }
        let (lba, off) = self.fat_location(cluster);
        let mut sector = [0u8; SECTOR_SIZE];
        self.dev.block_read(lba, 1, &mut sector)?;
        let merged = (read_u32(&sector, off) & !FAT_ENTRY_MASK) | (value & FAT_ENTRY_MASK);
        write_u32(&mut sector, off, merged);
        self.dev.block_write(lba, 1, &sector)?;

        for fat in 1..self.geo.fat_count {
            let mirror = lba + fat as u64 * self.geo.sectors_per_fat as u64;
            if self.dev.block_write(mirror, 1, &sector).is_err() {
                log::warn!("[FAT32] FAT mirror {} write failed for cluster {}", fat, cluster);
            }
        }
        Ok(())
    }

    /// Find a free cluster (starting at the FSInfo hint), mark it
    /// end-of-chain, zero it on disk, and update the accounting
    /// best-effort. The scan wraps once through the whole cluster space
    /// before giving up.
    pub(crate) fn allocate_cluster(&mut self) -> Result<u32, FsError> {
        let total = self.geo.total_clusters;
        let start = if self.fsinfo.valid {
            let hint = self.fsinfo.next_free;
            if hint >= 2 && hint < total + 2 {
                hint
            } else {
                2
            }
        } else {
            2
        };

        let mut sector = [0u8; SECTOR_SIZE];
        let mut cached_lba = u64::MAX;
        let mut cluster = start;
        let mut found = None;
        for _ in 0..total {
            let (lba, off) = self.fat_location(cluster);
            if lba != cached_lba {
                self.dev.block_read(lba, 1, &mut sector)?;
                cached_lba = lba;
            }
            if read_u32(&sector, off) & FAT_ENTRY_MASK == FAT_FREE {
                found = Some(cluster);
                break;
            }
            cluster += 1;
            if cluster >= total + 2 {
                cluster = 2;
            }
        }
        let cluster = found.ok_or(FsError::NoSpace)?;

        self.update_fat_entry(cluster, FAT_EOC)?;

        if self.fsinfo.valid {
            if self.fsinfo.free_count != FSINFO_UNKNOWN && self.fsinfo.free_count > 0 {
                self.fsinfo.free_count -= 1;
            }
            self.fsinfo.next_free = if cluster + 1 < total + 2 { cluster + 1 } else { 2 };
            self.store_fsinfo();
        }

        let lba = self.cluster_to_lba(cluster);
        self.zero_sectors(lba, self.geo.sectors_per_cluster as u32)?;
        Ok(cluster)
    }

    /// Walk from `head`, freeing every cluster. Returns the count
    /// freed. Corrupt links terminate the walk after a warning.
    pub(crate) fn free_cluster_chain(&mut self, head: u32) -> Result<u32, FsError> {
        if !self.is_valid_cluster(head) {
            return Err(FsError::BadParameter);
        }
        let mut current = head;
        let mut freed = 0u32;
        loop {
            let next = self.read_fat_entry(current)?;
            self.update_fat_entry(current, FAT_FREE)?;
            freed += 1;
            if next >= FAT_EOC_MIN {
                break;
            }
            if !self.is_valid_cluster(next) {
                log::warn!(
                    "[FAT32] corrupt link {:#x} while freeing chain after cluster {}",
                    next,
                    current
                );
                break;
            }
            current = next;
        }

        if self.fsinfo.valid {
            if self.fsinfo.free_count != FSINFO_UNKNOWN {
                self.fsinfo.free_count = self.fsinfo.free_count.saturating_add(freed);
            }
            self.fsinfo.next_free = head;
            self.store_fsinfo();
        }
        Ok(freed)
    }

    /// Free-cluster count: FSInfo when known, otherwise a full FAT
    /// scan.
    pub fn free_cluster_count(&mut self) -> Result<u32, FsError> {
        if self.fsinfo.valid && self.fsinfo.free_count != FSINFO_UNKNOWN {
            return Ok(self.fsinfo.free_count);
        }

        let mut free = 0u32;
        let mut sector = [0u8; SECTOR_SIZE];
        let mut cached_lba = u64::MAX;
        for cluster in 2..self.geo.total_clusters + 2 {
            let (lba, off) = self.fat_location(cluster);
            if lba != cached_lba {
                self.dev.block_read(lba, 1, &mut sector)?;
                cached_lba = lba;
            }
            if read_u32(&sector, off) & FAT_ENTRY_MASK == FAT_FREE {
                free += 1;
            }
        }
        Ok(free)
    }

    /// Write the cached FSInfo counters back, best-effort. Never
    /// resynthesizes a sector whose signatures have gone bad.
    fn store_fsinfo(&mut self) {
        if !self.fsinfo.valid {
            return;
        }
        let mut sector = [0u8; SECTOR_SIZE];
        if self.dev.block_read(self.geo.fsinfo_sector as u64, 1, &mut sector).is_err() {
            log::warn!("[FAT32] FSInfo re-read failed; skipping update");
            return;
        }
        if !fsinfo_signatures_ok(&sector) {
            log::warn!("[FAT32] FSInfo signatures vanished; marking unknown");
            self.fsinfo = FsInfoState::UNKNOWN;
            return;
        }
        write_u32(&mut sector, FSINFO_OFF_FREE_COUNT, self.fsinfo.free_count);
        write_u32(&mut sector, FSINFO_OFF_NEXT_FREE, self.fsinfo.next_free);
        if self.dev.block_write(self.geo.fsinfo_sector as u64, 1, &sector).is_err() {
            log::warn!("[FAT32] FSInfo writeback failed");
        }
    }

    /// Zero `count` sectors from `lba`, staged through the fill chunk.
    fn zero_sectors(&mut self, lba: u64, count: u32) -> Result<(), FsError> {
        let chunk = [0u8; CHUNK_SIZE_FOR_FILL];
        let sectors_per_chunk = (CHUNK_SIZE_FOR_FILL / SECTOR_SIZE) as u32;
        let mut done = 0u32;
        while done < count {
            let n = (count - done).min(sectors_per_chunk);
            self.dev.block_write(lba + done as u64, n, &chunk[..n as usize * SECTOR_SIZE])?;
            done += n;
        }
        Ok(())
    }

    fn read_cluster_scratch(&mut self, cluster: u32) -> Result<(), FsError> {
        if !self.is_valid_cluster(cluster) {
            return Err(FsError::BadParameter);
        }
        let lba = self.cluster_to_lba(cluster);
        self.dev.block_read(lba, self.geo.sectors_per_cluster as u32, &mut self.scratch)?;
        Ok(())
    }

    fn write_cluster_scratch(&mut self, cluster: u32) -> Result<(), FsError> {
        if !self.is_valid_cluster(cluster) {
            return Err(FsError::BadParameter);
        }
        let lba = self.cluster_to_lba(cluster);
        self.dev.block_write(lba, self.geo.sectors_per_cluster as u32, &self.scratch)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Directory operations
    // ------------------------------------------------------------------

    /// One pass over a directory chain: find `target` (if any), the
    /// first reusable slot, and the chain's last cluster. Scanning
    /// stops at the 0x00 terminator and never reads past it.
    fn scan_directory(
        &mut self,
        dir_cluster: u32,
        target: Option<&ShortName>,
        files_only: bool,
    ) -> Result<DirScan, FsError> {
        if !self.is_valid_cluster(dir_cluster) {
            return Err(FsError::BadParameter);
        }
        let entries_per_cluster = self.geo.bytes_per_cluster / DIR_ENTRY_SIZE;
        let mut scan = DirScan { found: None, free_slot: None, last_cluster: dir_cluster };
        let mut cluster = dir_cluster;
        let mut visited = 0u32;

        loop {
            self.read_cluster_scratch(cluster)?;
            for index in 0..entries_per_cluster {
                let entry = RawDirEntry::from_slice(&self.scratch[index * DIR_ENTRY_SIZE..]);
                if entry.is_end() {
                    if scan.free_slot.is_none() {
                        scan.free_slot = Some(EntrySlot { cluster, index });
                    }
                    scan.last_cluster = cluster;
                    return Ok(scan);
                }
                if entry.is_deleted() {
                    if scan.free_slot.is_none() {
                        scan.free_slot = Some(EntrySlot { cluster, index });
                    }
                    continue;
                }
                if entry.is_long_name() {
                    continue;
                }
                if files_only && (entry.is_volume_label() || entry.is_directory()) {
                    continue;
                }
                if let Some(name) = target {
                    if scan.found.is_none() && name.matches(&entry) {
                        scan.found = Some((EntrySlot { cluster, index }, entry));
                    }
                }
            }

            scan.last_cluster = cluster;
            let next = self.next_cluster(cluster)?;
            if next >= FAT_EOC_MIN {
                return Ok(scan);
            }
            cluster = next;
            visited += 1;
            if visited > self.geo.total_clusters {
                log::warn!("[FAT32] directory chain loop at cluster {}", cluster);
                return Err(FsError::CorruptMetadata);
            }
        }
    }

    /// List every live, non-LFN entry of a directory (volume labels
    /// included).
    pub fn list_directory(&mut self, dir_cluster: u32) -> Result<Vec<DirEntryInfo>, FsError> {
        if !self.is_valid_cluster(dir_cluster) {
            return Err(FsError::BadParameter);
        }
        let entries_per_cluster = self.geo.bytes_per_cluster / DIR_ENTRY_SIZE;
        let mut out = Vec::new();
        let mut cluster = dir_cluster;
        let mut visited = 0u32;

        'chain: loop {
            self.read_cluster_scratch(cluster)?;
            for index in 0..entries_per_cluster {
                let entry = RawDirEntry::from_slice(&self.scratch[index * DIR_ENTRY_SIZE..]);
                if entry.is_end() {
                    break 'chain;
                }
                if entry.is_deleted() || entry.is_long_name() {
                    continue;
                }
                out.push(DirEntryInfo {
                    name: entry.display_name(),
                    attributes: entry.attributes(),
                    first_cluster: entry.first_cluster(),
                    size: entry.file_size(),
                    is_directory: entry.is_directory(),
                    is_volume_label: entry.is_volume_label(),
                });
            }

            let next = self.next_cluster(cluster)?;
            if next >= FAT_EOC_MIN {
                break;
            }
            cluster = next;
            visited += 1;
            if visited > self.geo.total_clusters {
                log::warn!("[FAT32] directory chain loop at cluster {}", cluster);
                return Err(FsError::CorruptMetadata);
            }
        }
        Ok(out)
    }

    /// Read `name` from the directory at `dir_cluster` into `buf`.
    ///
    /// Returns the byte count delivered. A buffer smaller than the file
    /// receives the prefix that fits, with a warning; the call still
    /// succeeds.
    pub fn read_file(
        &mut self,
        dir_cluster: u32,
        name: &str,
        buf: &mut [u8],
    ) -> Result<usize, FsError> {
        let short = ShortName::normalize(name)?;
        let scan = self.scan_directory(dir_cluster, Some(&short), true)?;
        let (_, entry) = scan.found.ok_or(FsError::NotFound)?;

        let file_size = entry.file_size() as usize;
        let to_read = if buf.len() < file_size {
            log::warn!(
                "[FAT32] buffer holds {} of {} bytes of {}; delivering a partial read",
                buf.len(),
                file_size,
                name
            );
            buf.len()
        } else {
            file_size
        };

        let mut cluster = entry.first_cluster();
        let mut done = 0usize;
        while done < to_read {
            if !self.is_valid_cluster(cluster) {
                log::warn!("[FAT32] chain of {} ended {} bytes early", name, to_read - done);
                return Err(FsError::CorruptMetadata);
            }
            self.read_cluster_scratch(cluster)?;
            let n = (to_read - done).min(self.geo.bytes_per_cluster);
            buf[done..done + n].copy_from_slice(&self.scratch[..n]);
            done += n;
            if done < to_read {
                cluster = self.next_cluster(cluster)?;
            }
        }
        Ok(done)
    }

    /// Delete `name`: free its cluster chain, then tombstone the entry.
    pub fn delete_file(&mut self, dir_cluster: u32, name: &str) -> Result<(), FsError> {
        let short = ShortName::normalize(name)?;
        let scan = self.scan_directory(dir_cluster, Some(&short), true)?;
        let (slot, entry) = scan.found.ok_or(FsError::NotFound)?;

        let first = entry.first_cluster();
        if first >= 2 {
            self.free_cluster_chain(first)?;
        }

        self.read_cluster_scratch(slot.cluster)?;
        self.scratch[slot.index * DIR_ENTRY_SIZE] = ENTRY_DELETED;
        self.write_cluster_scratch(slot.cluster)
    }

    /// Create or overwrite `name` with `data`.
    ///
    /// Overwrites free the old chain first; a failure while building
    /// the new chain frees whatever was allocated before the error is
    /// returned.
    pub fn write_file(&mut self, dir_cluster: u32, name: &str, data: &[u8]) -> Result<(), FsError> {
        if data.len() as u64 > u32::MAX as u64 {
            return Err(FsError::BadParameter);
        }
        let short = ShortName::normalize(name)?;
        let scan = self.scan_directory(dir_cluster, Some(&short), true)?;

        if let Some((_, entry)) = &scan.found {
            let first = entry.first_cluster();
            if first >= 2 {
                self.free_cluster_chain(first)?;
            }
        }

        let bpc = self.geo.bytes_per_cluster;
        let clusters_needed = (data.len() + bpc - 1) / bpc;
        let mut first_cluster = 0u32;
        let mut prev = 0u32;
        for i in 0..clusters_needed {
            let cluster = match self.allocate_cluster() {
                Ok(c) => c,
                Err(e) => {
                    if first_cluster >= 2 {
                        let _ = self.free_cluster_chain(first_cluster);
                    }
                    return Err(e);
                }
            };
            if prev >= 2 {
                if let Err(e) = self.update_fat_entry(prev, cluster) {
                    let _ = self.free_cluster_chain(first_cluster);
                    let _ = self.free_cluster_chain(cluster);
                    return Err(e);
                }
            } else {
                first_cluster = cluster;
            }

            let start = i * bpc;
            let n = (data.len() - start).min(bpc);
            self.scratch[..n].copy_from_slice(&data[start..start + n]);
            // Zero-pad the final cluster past the payload.
            for b in &mut self.scratch[n..] {
                *b = 0;
            }
            if let Err(e) = self.write_cluster_scratch(cluster) {
                let _ = self.free_cluster_chain(first_cluster);
                return Err(e);
            }
            prev = cluster;
        }

        let result = if let Some((slot, entry)) = scan.found {
            let mut entry = entry;
            entry.set_first_cluster(first_cluster);
            entry.set_file_size(data.len() as u32);
            self.put_entry(slot, &entry)
        } else {
            let slot = match scan.free_slot {
                Some(slot) => Ok(slot),
                None => self.extend_directory(scan.last_cluster),
            };
            slot.and_then(|slot| {
                let entry =
                    RawDirEntry::new_entry(&short, ATTR_ARCHIVE, first_cluster, data.len() as u32);
                self.put_entry(slot, &entry)
            })
        };

        if let Err(e) = result {
            if first_cluster >= 2 {
                let _ = self.free_cluster_chain(first_cluster);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Create a fresh file or subdirectory entry in `dir_cluster`.
    ///
    /// Directories get a data cluster seeded with "." and ".."; files
    /// start with no cluster until data is written. Returns the new
    /// entry's first data cluster (0 for a file).
    pub fn create_entry(
        &mut self,
        dir_cluster: u32,
        name: &str,
        attributes: u8,
    ) -> Result<u32, FsError> {
        let short = ShortName::normalize(name)?;
        let scan = self.scan_directory(dir_cluster, Some(&short), false)?;
        if scan.found.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let slot = match scan.free_slot {
            Some(slot) => slot,
            None => self.extend_directory(scan.last_cluster)?,
        };

        let data_cluster = if attributes & ATTR_DIRECTORY != 0 {
            let cluster = self.allocate_cluster()?;
            // "." points at the new directory, ".." at its parent; the
            // rest of the cluster arrives zeroed.
            let dot = RawDirEntry::new_entry(&ShortName::DOT, ATTR_DIRECTORY, cluster, 0);
            let dotdot = RawDirEntry::new_entry(&ShortName::DOT_DOT, ATTR_DIRECTORY, dir_cluster, 0);
            self.read_cluster_scratch(cluster)?;
            self.scratch[..DIR_ENTRY_SIZE].copy_from_slice(&dot.0);
            self.scratch[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(&dotdot.0);
            if let Err(e) = self.write_cluster_scratch(cluster) {
                let _ = self.free_cluster_chain(cluster);
                return Err(e);
            }
            cluster
        } else {
            0
        };

        let entry = RawDirEntry::new_entry(&short, attributes, data_cluster, 0);
        if let Err(e) = self.put_entry(slot, &entry) {
            if data_cluster >= 2 {
                let _ = self.free_cluster_chain(data_cluster);
            }
            return Err(e);
        }
        Ok(data_cluster)
    }

    fn put_entry(&mut self, slot: EntrySlot, entry: &RawDirEntry) -> Result<(), FsError> {
        self.read_cluster_scratch(slot.cluster)?;
        let off = slot.index * DIR_ENTRY_SIZE;
        self.scratch[off..off + DIR_ENTRY_SIZE].copy_from_slice(&entry.0);
        self.write_cluster_scratch(slot.cluster)
    }

    /// Append one zeroed cluster to a directory chain; its first entry
    /// becomes the insertion slot.
    fn extend_directory(&mut self, last_cluster: u32) -> Result<EntrySlot, FsError> {
        let new_cluster = self.allocate_cluster()?;
        if let Err(e) = self.update_fat_entry(last_cluster, new_cluster) {
            let _ = self.free_cluster_chain(new_cluster);
            return Err(e);
        }
        Ok(EntrySlot { cluster: new_cluster, index: 0 })
    }
}

// ============================================================================
// Formatting
// ============================================================================

/// Cluster-size ladder keyed on raw volume size.
fn cluster_ladder(total_sectors: u64) -> u8 {
    let bytes = total_sectors * SECTOR_SIZE as u64;
    if bytes >= 32 * GIB {
        64
    } else if bytes >= 16 * GIB {
        32
    } else if bytes >= 2 * GIB {
        16
    } else if bytes >= 512 * MIB {
        8
    } else {
        4
    }
}

/// Approximate sectors-per-FAT, as `ceil(clusters * 4 / 512)` over the
/// pre-FAT estimate of the cluster count. May slightly over- or
/// under-allocate the FAT area; the format tolerates both.
fn estimate_fat_size(total_sectors: u64, spc: u8) -> u32 {
    let approx_data = total_sectors.saturating_sub(RESERVED_SECTORS as u64);
    let approx_clusters = approx_data / spc as u64;
    let size = ((approx_clusters * 4 + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64) as u32;
    if size == 0 {
        1
    } else {
        size
    }
}

fn build_boot_sector(sector: &mut [u8; SECTOR_SIZE], total_sectors: u64, spc: u8, label: &str) {
    *sector = [0u8; SECTOR_SIZE];
    sector[0] = 0xEB;
    sector[1] = 0x58;
    sector[2] = 0x90;
    sector[3..11].copy_from_slice(b"BRINEFAT");
    write_u16(sector, 11, SECTOR_SIZE as u16);
    sector[13] = spc;
    write_u16(sector, 14, RESERVED_SECTORS);
    sector[16] = FAT_COUNT;
    // Root entry count, total_sectors_16, and fat_size_16 stay zero on
    // FAT32.
    sector[21] = MEDIA_DESCRIPTOR;
    write_u16(sector, 24, 63); // sectors per track
    write_u16(sector, 26, 255); // heads

    let total32 = if total_sectors > u32::MAX as u64 {
        log::warn!("[FAT32] volume exceeds the 32-bit sector count; clamping");
        u32::MAX
    } else {
        total_sectors as u32
    };
    write_u32(sector, 32, total32);
    write_u32(sector, 36, estimate_fat_size(total_sectors, spc));
    write_u32(sector, 44, ROOT_CLUSTER);
    write_u16(sector, 48, FSINFO_SECTOR);
    write_u16(sector, 50, BACKUP_BOOT_SECTOR);
    sector[64] = 0x80; // drive number
    sector[66] = 0x29; // extended boot signature
    write_u32(sector, 67, DEFAULT_VOLUME_ID);

    let mut field = [b' '; 11];
    for (i, &b) in label.as_bytes().iter().take(11).enumerate() {
        if b != b'.' {
            field[i] = b;
        }
    }
    sector[71..82].copy_from_slice(&field);
    sector[82..90].copy_from_slice(b"FAT32   ");
    sector[510] = 0x55;
    sector[511] = 0xAA;
}

fn build_fsinfo_sector(sector: &mut [u8; SECTOR_SIZE], total_clusters: u32) {
    *sector = [0u8; SECTOR_SIZE];
    write_u32(sector, FSINFO_OFF_LEAD, FSINFO_LEAD_SIG);
    write_u32(sector, FSINFO_OFF_STRUCT, FSINFO_STRUCT_SIG);
    // The root directory consumes cluster 2 immediately.
    write_u32(sector, FSINFO_OFF_FREE_COUNT, total_clusters.saturating_sub(1));
    write_u32(sector, FSINFO_OFF_NEXT_FREE, if total_clusters > 1 { 3 } else { 2 });
    write_u32(sector, FSINFO_OFF_TRAIL, FSINFO_TRAIL_SIG);
}

/// Lay down a fresh FAT32 volume: boot sector plus backup, FSInfo, the
/// FAT copies with their reserved entries, and a root directory holding
/// a single volume-label entry.
pub fn format_volume<D: BlockDevice>(
    dev: &mut D,
    total_sectors: u64,
    label: &str,
) -> Result<(), FsError> {
    let spc = cluster_ladder(total_sectors);
    let fat_size = estimate_fat_size(total_sectors, spc);
    let data_start = RESERVED_SECTORS as u64 + FAT_COUNT as u64 * fat_size as u64;
    if total_sectors <= data_start + spc as u64 {
        return Err(FsError::BadParameter);
    }
    let total_clusters = ((total_sectors - data_start) / spc as u64) as u32;

    let mut sector = [0u8; SECTOR_SIZE];
    build_boot_sector(&mut sector, total_sectors, spc, label);
    dev.block_write(0, 1, &sector)?;
    dev.block_write(BACKUP_BOOT_SECTOR as u64, 1, &sector)?;

    build_fsinfo_sector(&mut sector, total_clusters);
    dev.block_write(FSINFO_SECTOR as u64, 1, &sector)?;

    // First sector of each FAT: media entry, reserved entry, and the
    // root directory's end-of-chain.
    sector = [0u8; SECTOR_SIZE];
    write_u32(&mut sector, 0, FAT_EOC_MIN | ((MEDIA_DESCRIPTOR as u32) << 24));
    write_u32(&mut sector, 4, FAT_EOC);
    write_u32(&mut sector, ROOT_CLUSTER as usize * 4, FAT_EOC);
    for fat in 0..FAT_COUNT {
        dev.block_write(RESERVED_SECTORS as u64 + fat as u64 * fat_size as u64, 1, &sector)?;
    }

    // Clear the remainder of every FAT copy.
    let zero = [0u8; CHUNK_SIZE_FOR_FILL];
    let sectors_per_chunk = (CHUNK_SIZE_FOR_FILL / SECTOR_SIZE) as u32;
    for fat in 0..FAT_COUNT {
        let fat_start = RESERVED_SECTORS as u64 + fat as u64 * fat_size as u64;
        let mut s = 1u32;
        while s < fat_size {
            let n = (fat_size - s).min(sectors_per_chunk);
            dev.block_write(fat_start + s as u64, n, &zero[..n as usize * SECTOR_SIZE])?;
            s += n;
        }
    }

    // Root directory: zeroed cluster with the volume-label entry at
    // index 0.
    let root_lba = data_start + (ROOT_CLUSTER as u64 - 2) * spc as u64;
    let mut s = 0u32;
    while s < spc as u32 {
        let n = (spc as u32 - s).min(sectors_per_chunk);
        dev.block_write(root_lba + s as u64, n, &zero[..n as usize * SECTOR_SIZE])?;
        s += n;
    }
    sector = [0u8; SECTOR_SIZE];
    sector[..DIR_ENTRY_SIZE].copy_from_slice(&RawDirEntry::volume_label(label).0);
    dev.block_write(root_lba, 1, &sector)?;

    log::debug!(
        "[FAT32] formatted: {} sectors, {} sectors/cluster, {} clusters, label {:?}",
        total_sectors,
        spc,
        total_clusters,
        label
    );
    Ok(())
}
