//! Bare-metal SATA storage stack.
//!
//! Discovers the AHCI controller over PCI, drives its first active port
//! with DMA-issued ATA commands, and layers a FAT32 filesystem on the
//! resulting block interface. The surrounding system provides the
//! allocator, interrupt setup, and console; hardware access is confined
//! to the PCI configuration ports and the HBA's memory-mapped register
//! window.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod drivers;
pub mod pci;
pub mod vfs;

#[cfg(target_arch = "x86_64")]
pub mod logger;
#[cfg(target_arch = "x86_64")]
pub mod serial;

pub use drivers::ahci::{AhciError, Hba, PortPhase, SpinWait, WaitBudget};
pub use drivers::ata::{AddressingMode, AtaDrive, IdentifyInfo};
pub use drivers::partition::{Partition, PartitionDevice};
pub use vfs::fat32::{DirEntryInfo, Fat32Volume};
pub use vfs::{BlockDevice, BlockError, FsError};
