//! Tunables for the storage stack.
//!
//! Poll budgets are iteration counts, not time: they bound how long the
//! driver spins on stuck hardware and scale with CPU speed.

/// Sector size assumed throughout the stack.
pub const SECTOR_SIZE: usize = 512;

/// Largest single ATA DMA transfer, in sectors (64 KiB, one PRDT entry).
pub const MAX_SECTORS_PER_COMMAND: u16 = 128;

/// Budget for the HBA reset bit to self-clear (about a second of spins).
pub const HBA_RESET_BUDGET: u32 = 1_000_000;

/// Budget for a port's command engine to stop (CR and FR both clear).
pub const ENGINE_STOP_BUDGET: u32 = 1_000_000;

/// Budget for the task file to go idle before a command is issued.
pub const TASK_FILE_IDLE_BUDGET: u32 = 1_000_000;

/// Completion budget for IDENTIFY DEVICE.
pub const CMD_TIMEOUT_IDENTIFY: u32 = 5_000_000;

/// Completion budget for READ/WRITE DMA EXT.
pub const CMD_TIMEOUT_RW: u32 = 10_000_000;

/// Staging-buffer size for scratch fills (FAT clearing, cluster zeroing).
pub const CHUNK_SIZE_FOR_FILL: usize = 1024;
