//! AHCI (Advanced Host Controller Interface) driver.
//!
//! Owns the HBA's memory-mapped register window, the per-port DMA
//! regions (command list, received FIS, command table), and the port
//! command-engine state machine. All ATA traffic funnels through
//! command slot 0 of the single active port, so issues are totally
//! ordered and at most one command is ever in flight.
//!
//! Register access is 32-bit volatile throughout; polling loops are
//! iteration-counted through the [`WaitBudget`] trait rather than
//! clocked.

use alloc::boxed::Box;
use core::fmt;
use core::ptr;

use crate::config;

/// Register offsets of the AHCI 1.x map.
pub mod regs {
    /// Generic host control (offsets from the HBA base).
    pub mod host {
        pub const CAP: usize = 0x00;
        pub const GHC: usize = 0x04;
        pub const IS: usize = 0x08;
        pub const PI: usize = 0x0C;
        pub const VS: usize = 0x10;
    }

    /// Per-port registers (offsets from the port window).
    pub mod port {
        pub const CLB: usize = 0x00;
        pub const CLBU: usize = 0x04;
        pub const FB: usize = 0x08;
        pub const FBU: usize = 0x0C;
        pub const IS: usize = 0x10;
        pub const CMD: usize = 0x18;
        pub const TFD: usize = 0x20;
        pub const SIG: usize = 0x24;
        pub const SSTS: usize = 0x28;
        pub const SERR: usize = 0x30;
        pub const SACT: usize = 0x34;
        pub const CI: usize = 0x38;
    }
}

/// Port windows start at 0x100, 0x80 bytes each.
pub const PORT_WINDOW_BASE: usize = 0x100;
pub const PORT_WINDOW_SIZE: usize = 0x80;
pub const MAX_PORTS: usize = 32;

/// Only slot 0 is ever issued.
const COMMAND_SLOT: u32 = 0;

/// GHC bits
const GHC_HR: u32 = 1 << 0;
const GHC_AE: u32 = 1 << 31;

/// CAP bits
const CAP_S64A: u32 = 1 << 31;

/// PORT_CMD bits
const PORT_CMD_ST: u32 = 1 << 0;
const PORT_CMD_FRE: u32 = 1 << 4;
const PORT_CMD_FR: u32 = 1 << 14;
const PORT_CMD_CR: u32 = 1 << 15;

/// TFD status bits (mirror of the ATA status byte)
const TFD_ERR: u32 = 1 << 0;
const TFD_DRQ: u32 = 1 << 3;
const TFD_DF: u32 = 1 << 5;
const TFD_BSY: u32 = 1 << 7;

/// SSTS fields
const SSTS_DET_MASK: u32 = 0xF;
const SSTS_DET_ESTABLISHED: u32 = 3;
const SSTS_IPM_ACTIVE: u32 = 1;

/// SATA signatures
pub const SATA_SIG_ATA: u32 = 0x0000_0101;
pub const SATA_SIG_ATAPI: u32 = 0xEB14_0101;

/// Largest byte count one PRDT entry can carry (22-bit count-minus-one).
const PRDT_MAX_BYTES: usize = 4 * 1024 * 1024;
const PRDT_IOC: u32 = 1 << 31;

// ============================================================================
// Error taxonomy
// ============================================================================

/// Failures surfaced by the AHCI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AhciError {
    /// PCI scan found no AHCI-class device.
    NoController,
    /// No implemented port passed the DET/IPM presence check.
    NoDevice,
    /// GHC.HR did not self-clear within its budget.
    ResetTimeout,
    /// Engine stop/start failed, or the port refuses further commands.
    PortBringupFailed,
    /// The task file stayed busy before issue; retry-able after a delay,
    /// but this driver does not retry.
    DeviceBusy,
    /// PORT_CI did not clear within the budget. The DMA buffer must be
    /// treated as poisoned; only a port reset would recover.
    Timeout,
    /// The device raised ERR or DF; carries the TFD status byte and the
    /// SERR register as diagnostics.
    DeviceError { tfd: u8, serr: u32 },
    /// Rejected before reaching the hardware.
    BadParameter,
}

impl fmt::Display for AhciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AhciError::NoController => write!(f, "no AHCI controller"),
            AhciError::NoDevice => write!(f, "no SATA device present"),
            AhciError::ResetTimeout => write!(f, "HBA reset timed out"),
            AhciError::PortBringupFailed => write!(f, "port bring-up failed"),
            AhciError::DeviceBusy => write!(f, "device busy"),
            AhciError::Timeout => write!(f, "command timed out"),
            AhciError::DeviceError { tfd, serr } => {
                write!(f, "device error (tfd={:#04x} serr={:#010x})", tfd, serr)
            }
            AhciError::BadParameter => write!(f, "bad parameter"),
        }
    }
}

// ============================================================================
// Polling
// ============================================================================

/// Iteration-bounded polling.
///
/// The budget is a spin count, not a duration: it places an upper bound
/// on stuck hardware without assuming a time source.
pub trait WaitBudget {
    /// Poll `cond` until it returns true or `budget` iterations elapse.
    fn wait_until(&mut self, budget: u32, cond: &mut dyn FnMut() -> bool) -> bool;
}

/// CPU-bounded spin, the bare-metal implementation.
pub struct SpinWait;

impl WaitBudget for SpinWait {
    fn wait_until(&mut self, budget: u32, cond: &mut dyn FnMut() -> bool) -> bool {
        for _ in 0..budget {
            if cond() {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    }
}

// ============================================================================
// MMIO
// ============================================================================

/// Volatile 32-bit access to the HBA register file.
#[derive(Clone, Copy)]
struct Mmio {
    base: *mut u8,
}

// The register window is exclusively owned by its Hba.
unsafe impl Send for Mmio {}

impl Mmio {
    /// Caller guarantees `base` points at an AHCI register file that
    /// stays mapped for the lifetime of the handle.
    unsafe fn new(base: u64) -> Self {
        Self { base: base as *mut u8 }
    }

    fn read32(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile(self.base.add(offset) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile(self.base.add(offset) as *mut u32, value) }
    }
}

// ============================================================================
// FIS (Frame Information Structure) types
// ============================================================================

/// FIS type identifiers.
#[repr(u8)]
#[derive(Clone, Copy)]
pub enum FisType {
    RegH2D = 0x27,      // Register FIS - Host to Device
    RegD2H = 0x34,      // Register FIS - Device to Host
    DmaActivate = 0x39, // DMA Activate FIS
    DmaSetup = 0x41,    // DMA Setup FIS
    Data = 0x46,        // Data FIS
    Bist = 0x58,        // BIST Activate FIS
    PioSetup = 0x5F,    // PIO Setup FIS
    DevBits = 0xA1,     // Set Device Bits FIS
}

/// Register FIS, host to device. 5 dwords.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FisRegH2D {
    pub fis_type: u8, // FisType::RegH2D
    pub pmport_c: u8, // PM port | C bit (command/control)
    pub command: u8,  // ATA command
    pub featurel: u8,

    pub lba0: u8,
    pub lba1: u8,
    pub lba2: u8,
    pub device: u8,

    pub lba3: u8,
    pub lba4: u8,
    pub lba5: u8,
    pub featureh: u8,

    pub countl: u8,
    pub counth: u8,
    pub icc: u8,
    pub control: u8,

    _reserved: [u8; 4],
}

impl FisRegH2D {
    pub const fn new() -> Self {
        Self {
            fis_type: FisType::RegH2D as u8,
            pmport_c: 0,
            command: 0,
            featurel: 0,
            lba0: 0,
            lba1: 0,
            lba2: 0,
            device: 0,
            lba3: 0,
            lba4: 0,
            lba5: 0,
            featureh: 0,
            countl: 0,
            counth: 0,
            icc: 0,
            control: 0,
            _reserved: [0; 4],
        }
    }

    /// An H2D command FIS with the LBA split across lba0..lba5 and the
    /// device byte in LBA mode.
    fn for_command(command: u8, lba: u64, count: u16) -> Self {
        let mut fis = Self::new();
        fis.pmport_c = 0x80; // C bit: this is a command
        fis.command = command;
        fis.lba0 = lba as u8;
        fis.lba1 = (lba >> 8) as u8;
        fis.lba2 = (lba >> 16) as u8;
        fis.device = 0x40; // LBA mode
        fis.lba3 = (lba >> 24) as u8;
        fis.lba4 = (lba >> 32) as u8;
        fis.lba5 = (lba >> 40) as u8;
        fis.countl = count as u8;
        fis.counth = (count >> 8) as u8;
        fis
    }
}

/// Command FIS length in dwords, written into the header CFL field.
const CFIS_DWORDS: u8 = (core::mem::size_of::<FisRegH2D>() / 4) as u8;

// ============================================================================
// Command structures
// ============================================================================

/// Command header flag bits.
const HDR_CFL_MASK: u16 = 0x1F;
const HDR_WRITE: u16 = 1 << 6;

/// One of the 32 command headers in a port's command list.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CommandHeader {
    pub flags: u16,
    pub prdtl: u16,
    pub prdbc: u32,
    pub ctba: u32,
    pub ctbau: u32,
    _reserved: [u32; 4],
}

impl CommandHeader {
    pub const fn new() -> Self {
        Self { flags: 0, prdtl: 0, prdbc: 0, ctba: 0, ctbau: 0, _reserved: [0; 4] }
    }

    fn set_cfis_len(&mut self, dwords: u8) {
        self.flags = (self.flags & !HDR_CFL_MASK) | (dwords as u16 & HDR_CFL_MASK);
    }

    fn set_write(&mut self, write: bool) {
        if write {
            self.flags |= HDR_WRITE;
        } else {
            self.flags &= !HDR_WRITE;
        }
    }
}

/// Physical region descriptor. DBC holds count-minus-one in 22 bits;
/// bit 31 requests an interrupt on completion.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PrdtEntry {
    pub dba: u32,
    pub dbau: u32,
    _reserved: u32,
    pub dbc_i: u32,
}

impl PrdtEntry {
    const fn new() -> Self {
        Self { dba: 0, dbau: 0, _reserved: 0, dbc_i: 0 }
    }

    fn describe(addr: u64, len: usize) -> Self {
        debug_assert!(len > 0 && len <= PRDT_MAX_BYTES);
        Self {
            dba: addr as u32,
            dbau: (addr >> 32) as u32,
            _reserved: 0,
            dbc_i: ((len - 1) as u32 & 0x003F_FFFF) | PRDT_IOC,
        }
    }
}

/// Command table: the CFIS area, ATAPI command bytes, and the inline
/// PRDT. This driver uses exactly one PRDT entry per command.
#[repr(C, align(128))]
pub struct CommandTable {
    pub cfis: FisRegH2D,
    _cfis_pad: [u8; 64 - core::mem::size_of::<FisRegH2D>()],
    pub acmd: [u8; 16],
    _reserved: [u8; 48],
    pub prdt: [PrdtEntry; 1],
}

impl CommandTable {
    const fn new() -> Self {
        Self {
            cfis: FisRegH2D::new(),
            _cfis_pad: [0; 64 - core::mem::size_of::<FisRegH2D>()],
            acmd: [0; 16],
            _reserved: [0; 48],
            prdt: [PrdtEntry::new(); 1],
        }
    }
}

/// Command list: 32 headers, 1 KiB, 1 KiB aligned.
#[repr(C, align(1024))]
pub struct CommandList {
    pub headers: [CommandHeader; 32],
}

impl CommandList {
    const fn new() -> Self {
        Self { headers: [CommandHeader::new(); 32] }
    }
}

/// Received-FIS buffer. The HBA writes completion FISes here; the
/// driver consumes completions through TFD only, so the contents stay
/// opaque.
#[repr(C, align(256))]
pub struct ReceivedFis {
    _bytes: [u8; 256],
}

impl ReceivedFis {
    const fn new() -> Self {
        Self { _bytes: [0; 256] }
    }
}

const _: () = {
    assert!(core::mem::size_of::<FisRegH2D>() == 20);
    assert!(core::mem::size_of::<CommandHeader>() == 32);
    assert!(core::mem::size_of::<CommandList>() == 1024);
    assert!(core::mem::size_of::<PrdtEntry>() == 16);
    assert!(core::mem::size_of::<ReceivedFis>() == 256);
};

/// DMA regions owned by an active port, each at its required alignment.
/// Dropping the port memory releases them.
struct PortMemory {
    cmd_list: Box<CommandList>,
    fis: Box<ReceivedFis>,
    table: Box<CommandTable>,
}

impl PortMemory {
    fn new() -> Self {
        Self {
            cmd_list: Box::new(CommandList::new()),
            fis: Box::new(ReceivedFis::new()),
            table: Box::new(CommandTable::new()),
        }
    }

    fn cmd_list_addr(&self) -> u64 {
        &*self.cmd_list as *const CommandList as u64
    }

    fn fis_addr(&self) -> u64 {
        &*self.fis as *const ReceivedFis as u64
    }

    fn table_addr(&self) -> u64 {
        &*self.table as *const CommandTable as u64
    }
}

// ============================================================================
// Requests
// ============================================================================

/// The DMA buffer of a request, which also fixes the transfer direction.
pub enum DmaBuffer<'a> {
    /// Device-to-host transfer (reads, IDENTIFY).
    ToHost(&'a mut [u8]),
    /// Host-to-device transfer (writes).
    FromHost(&'a [u8]),
}

impl DmaBuffer<'_> {
    fn addr(&self) -> u64 {
        match self {
            DmaBuffer::ToHost(buf) => buf.as_ptr() as u64,
            DmaBuffer::FromHost(buf) => buf.as_ptr() as u64,
        }
    }

    fn len(&self) -> usize {
        match self {
            DmaBuffer::ToHost(buf) => buf.len(),
            DmaBuffer::FromHost(buf) => buf.len(),
        }
    }

    fn is_device_bound(&self) -> bool {
        matches!(self, DmaBuffer::FromHost(_))
    }
}

/// One generic ATA DMA command. Transient: exists only across a single
/// synchronous issue.
pub struct AtaDmaRequest<'a> {
    pub command: u8,
    pub lba: u64,
    pub sector_count: u16,
    pub buffer: DmaBuffer<'a>,
    /// Completion poll budget for this command class.
    pub timeout: u32,
}

// ============================================================================
// Host bus adapter
// ============================================================================

/// Port command-engine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPhase {
    Unimplemented,
    Idle,
    Initializing,
    Running,
    Faulted,
}

/// The host bus adapter: owns the MMIO window and the active port's DMA
/// regions.
pub struct Hba<W: WaitBudget = SpinWait> {
    mmio: Mmio,
    waiter: W,
    /// Subtracted from virtual addresses to form DMA addresses; zero
    /// under identity mapping.
    dma_offset: u64,
    ncs: u8,
    s64a: bool,
    pi: u32,
    phases: [PortPhase; MAX_PORTS],
    active: Option<usize>,
    mem: Option<PortMemory>,
    in_flight: bool,
    last_fault: Option<AhciError>,
}

impl Hba<SpinWait> {
    /// # Safety
    ///
    /// `base` must be the virtual address of an AHCI register file that
    /// stays mapped and is not accessed by anything else.
    pub unsafe fn new(base: u64) -> Self {
        Self::with_waiter(base, SpinWait)
    }
}

impl<W: WaitBudget> Hba<W> {
    /// # Safety
    ///
    /// Same contract as [`Hba::new`].
    pub unsafe fn with_waiter(base: u64, waiter: W) -> Self {
        Self {
            mmio: Mmio::new(base),
            waiter,
            dma_offset: 0,
            ncs: 0,
            s64a: false,
            pi: 0,
            phases: [PortPhase::Unimplemented; MAX_PORTS],
            active: None,
            mem: None,
            in_flight: false,
            last_fault: None,
        }
    }

    /// Virtual-to-DMA address offset (for higher-half mappings).
    /// Defaults to zero: virtual equals physical.
    pub fn set_dma_offset(&mut self, offset: u64) {
        self.dma_offset = offset;
    }

    pub fn active_port(&self) -> Option<usize> {
        self.active
    }

    pub fn port_phase(&self, port: usize) -> PortPhase {
        self.phases.get(port).copied().unwrap_or(PortPhase::Unimplemented)
    }

    pub fn command_slots(&self) -> u8 {
        self.ncs
    }

    pub fn ports_implemented(&self) -> u32 {
        self.pi
    }

    /// True while a command is issued and not yet retired.
    pub fn has_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn waiter(&self) -> &W {
        &self.waiter
    }

    /// Raw generic-host-control register, for the status inspector.
    pub fn read_host_reg(&self, offset: usize) -> u32 {
        self.mmio.read32(offset)
    }

    /// Raw port register, for the status inspector.
    pub fn read_port_reg(&self, port: usize, reg: usize) -> u32 {
        self.pread(port, reg)
    }

    fn port_off(port: usize, reg: usize) -> usize {
        PORT_WINDOW_BASE + port * PORT_WINDOW_SIZE + reg
    }

    fn pread(&self, port: usize, reg: usize) -> u32 {
        self.mmio.read32(Self::port_off(port, reg))
    }

    fn pwrite(&self, port: usize, reg: usize, value: u32) {
        self.mmio.write32(Self::port_off(port, reg), value)
    }

    /// Full bring-up: reset the HBA, enable AHCI mode, find the first
    /// port with an established SATA device, and start its command
    /// engine.
    pub fn init(&mut self) -> Result<(), AhciError> {
        self.reset()?;
        self.enable_ahci();

        let cap = self.mmio.read32(regs::host::CAP);
        self.ncs = (((cap >> 8) & 0x1F) + 1) as u8;
        self.s64a = cap & CAP_S64A != 0;
        let version = self.mmio.read32(regs::host::VS);
        log::debug!(
            "[AHCI] version {}.{}, {} command slots, 64-bit addressing {}",
            version >> 16,
            version & 0xFFFF,
            self.ncs,
            if self.s64a { "supported" } else { "absent" }
        );

        let port = self.probe_ports()?;
        self.port_init(port)?;
        Ok(())
    }

    /// Request an HBA reset and poll GHC.HR until it self-clears.
    fn reset(&mut self) -> Result<(), AhciError> {
        let ghc = self.mmio.read32(regs::host::GHC);
        self.mmio.write32(regs::host::GHC, ghc | GHC_HR);

        let mmio = self.mmio;
        let cleared = self.waiter.wait_until(config::HBA_RESET_BUDGET, &mut || {
            mmio.read32(regs::host::GHC) & GHC_HR == 0
        });
        if cleared {
            Ok(())
        } else {
            Err(AhciError::ResetTimeout)
        }
    }

    fn enable_ahci(&mut self) {
        let ghc = self.mmio.read32(regs::host::GHC);
        self.mmio.write32(regs::host::GHC, ghc | GHC_AE);
    }

    /// Walk the implemented-ports bitmap; the first port with DET=3 and
    /// IPM=1 and a SATA signature becomes the active port.
    fn probe_ports(&mut self) -> Result<usize, AhciError> {
        self.pi = self.mmio.read32(regs::host::PI);

        for port in 0..MAX_PORTS {
            if self.pi & (1 << port) == 0 {
                continue;
            }

            let ssts = self.pread(port, regs::port::SSTS);
            let det = ssts & SSTS_DET_MASK;
            let ipm = (ssts >> 8) & 0xF;
            if det != SSTS_DET_ESTABLISHED || ipm != SSTS_IPM_ACTIVE {
                continue;
            }

            match self.pread(port, regs::port::SIG) {
                SATA_SIG_ATA => {
                    log::debug!("[AHCI] port {}: SATA device", port);
                }
                SATA_SIG_ATAPI => {
                    log::debug!("[AHCI] port {}: SATAPI device (not driven)", port);
                    continue;
                }
                other => {
                    log::debug!("[AHCI] port {}: unrecognized signature {:#010x}", port, other);
                    continue;
                }
            }

            self.phases[port] = PortPhase::Idle;
            self.active = Some(port);
            return Ok(port);
        }

        Err(AhciError::NoDevice)
    }

    /// Stop the command engine: clear ST then FRE, and poll until both
    /// CR and FR have dropped.
    fn stop_engine(&mut self, port: usize) -> Result<(), AhciError> {
        let cmd = self.pread(port, regs::port::CMD);
        self.pwrite(port, regs::port::CMD, cmd & !PORT_CMD_ST);
        let cmd = self.pread(port, regs::port::CMD);
        self.pwrite(port, regs::port::CMD, cmd & !PORT_CMD_FRE);

        let mmio = self.mmio;
        let off = Self::port_off(port, regs::port::CMD);
        let stopped = self.waiter.wait_until(config::ENGINE_STOP_BUDGET, &mut || {
            mmio.read32(off) & (PORT_CMD_CR | PORT_CMD_FR) == 0
        });
        if stopped {
            Ok(())
        } else {
            self.phases[port] = PortPhase::Faulted;
            Err(AhciError::PortBringupFailed)
        }
    }

    /// Bring one port from Idle to Running: fresh DMA regions, base
    /// pointers programmed, stale status cleared, engine started.
    fn port_init(&mut self, port: usize) -> Result<(), AhciError> {
        self.stop_engine(port)?;
        self.phases[port] = PortPhase::Idle;
        self.phases[port] = PortPhase::Initializing;

        let mut mem = PortMemory::new();
        let clb = mem.cmd_list_addr().wrapping_sub(self.dma_offset);
        let fb = mem.fis_addr().wrapping_sub(self.dma_offset);
        let ctba = mem.table_addr().wrapping_sub(self.dma_offset);
        mem.cmd_list.headers[COMMAND_SLOT as usize].ctba = ctba as u32;
        mem.cmd_list.headers[COMMAND_SLOT as usize].ctbau = (ctba >> 32) as u32;

        self.pwrite(port, regs::port::CLB, clb as u32);
        self.pwrite(port, regs::port::CLBU, (clb >> 32) as u32);
        self.pwrite(port, regs::port::FB, fb as u32);
        self.pwrite(port, regs::port::FBU, (fb >> 32) as u32);

        // Clear any stale interrupt and error status.
        self.pwrite(port, regs::port::IS, 0xFFFF_FFFF);
        self.pwrite(port, regs::port::SERR, 0xFFFF_FFFF);

        let cmd = self.pread(port, regs::port::CMD);
        self.pwrite(port, regs::port::CMD, cmd | PORT_CMD_FRE);
        let cmd = self.pread(port, regs::port::CMD);
        self.pwrite(port, regs::port::CMD, cmd | PORT_CMD_ST);

        let cmd = self.pread(port, regs::port::CMD);
        if cmd & (PORT_CMD_FRE | PORT_CMD_ST) != (PORT_CMD_FRE | PORT_CMD_ST) {
            self.phases[port] = PortPhase::Faulted;
            return Err(AhciError::PortBringupFailed);
        }

        self.mem = Some(mem);
        self.phases[port] = PortPhase::Running;
        Ok(())
    }

    /// Issue one ATA DMA command on slot 0 of the active port and block
    /// until it retires, errors, or exhausts its poll budget.
    pub fn issue_ata_dma(&mut self, request: AtaDmaRequest<'_>) -> Result<(), AhciError> {
        let port = self.active.ok_or(AhciError::NoDevice)?;
        match self.phases[port] {
            PortPhase::Running => {}
            PortPhase::Faulted => {
                return Err(self.last_fault.unwrap_or(AhciError::PortBringupFailed));
            }
            _ => return Err(AhciError::PortBringupFailed),
        }

        let count = request.sector_count;
        if count == 0 || count > config::MAX_SECTORS_PER_COMMAND {
            return Err(AhciError::BadParameter);
        }
        let byte_len = count as usize * config::SECTOR_SIZE;
        if request.buffer.len() < byte_len {
            return Err(AhciError::BadParameter);
        }
        let buf_addr = request.buffer.addr();
        if buf_addr & 1 != 0 {
            // The HBA requires word-aligned data buffers.
            return Err(AhciError::BadParameter);
        }

        // Wait for the task file to go idle before touching the slot.
        {
            let mmio = self.mmio;
            let tfd_off = Self::port_off(port, regs::port::TFD);
            let idle = self.waiter.wait_until(config::TASK_FILE_IDLE_BUDGET, &mut || {
                mmio.read32(tfd_off) & (TFD_BSY | TFD_DRQ) == 0
            });
            if !idle {
                return Err(AhciError::DeviceBusy);
            }
        }

        let (clb, fb, ctba) = {
            let mem = self.mem.as_ref().ok_or(AhciError::PortBringupFailed)?;
            (
                mem.cmd_list_addr().wrapping_sub(self.dma_offset),
                mem.fis_addr().wrapping_sub(self.dma_offset),
                mem.table_addr().wrapping_sub(self.dma_offset),
            )
        };

        // Rewrite the base pointers on every issue; redundant on a
        // quiescent HBA but guards against external corruption.
        self.pwrite(port, regs::port::CLB, clb as u32);
        self.pwrite(port, regs::port::CLBU, (clb >> 32) as u32);
        self.pwrite(port, regs::port::FB, fb as u32);
        self.pwrite(port, regs::port::FBU, (fb >> 32) as u32);

        let is_write = request.buffer.is_device_bound();
        {
            let mem = self.mem.as_mut().ok_or(AhciError::PortBringupFailed)?;
            let header = &mut mem.cmd_list.headers[COMMAND_SLOT as usize];
            header.set_cfis_len(CFIS_DWORDS);
            header.set_write(is_write);
            header.prdtl = 1;
            header.prdbc = 0;
            header.ctba = ctba as u32;
            header.ctbau = (ctba >> 32) as u32;

            let table = &mut *mem.table;
            *table = CommandTable::new();
            table.cfis = FisRegH2D::for_command(request.command, request.lba, count);
            table.prdt[0] = PrdtEntry::describe(buf_addr.wrapping_sub(self.dma_offset), byte_len);
        }

        // Descriptors must be visible to the HBA before CI is set.
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);

        self.pwrite(port, regs::port::IS, 0xFFFF_FFFF);
        self.pwrite(port, regs::port::CI, 1 << COMMAND_SLOT);
        self.in_flight = true;

        let mut fault: Option<(u8, u32)> = None;
        let completed = {
            let mmio = self.mmio;
            let tfd_off = Self::port_off(port, regs::port::TFD);
            let serr_off = Self::port_off(port, regs::port::SERR);
            let ci_off = Self::port_off(port, regs::port::CI);
            self.waiter.wait_until(request.timeout, &mut || {
                let tfd = mmio.read32(tfd_off);
                if tfd & (TFD_ERR | TFD_DF) != 0 {
                    fault = Some((tfd as u8, mmio.read32(serr_off)));
                    return true;
                }
                mmio.read32(ci_off) & (1 << COMMAND_SLOT) == 0
            })
        };
        self.in_flight = false;

        if let Some((tfd, serr)) = fault {
            let err = AhciError::DeviceError { tfd, serr };
            self.phases[port] = PortPhase::Faulted;
            self.last_fault = Some(err);
            return Err(err);
        }
        if !completed {
            self.phases[port] = PortPhase::Faulted;
            self.last_fault = Some(AhciError::Timeout);
            return Err(AhciError::Timeout);
        }

        let transferred = self
            .mem
            .as_ref()
            .map(|m| m.cmd_list.headers[COMMAND_SLOT as usize].prdbc)
            .unwrap_or(0);
        if transferred != byte_len as u32 {
            log::warn!(
                "[AHCI] port {}: transferred {} bytes, expected {}",
                port,
                transferred,
                byte_len
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    // A fake register file large enough for the host block plus two
    // port windows, leaked so the driver's raw pointer stays valid.
    const FAKE_REG_WORDS: usize = 0x200 / 4 + 0x40;
    const P0: usize = PORT_WINDOW_BASE;

    fn leak_regs() -> *mut u32 {
        Box::into_raw(Box::new([0u32; FAKE_REG_WORDS])) as *mut u32
    }

    fn reg_read(regs: *mut u32, off: usize) -> u32 {
        unsafe { core::ptr::read_volatile(regs.add(off / 4)) }
    }

    fn reg_write(regs: *mut u32, off: usize, v: u32) {
        unsafe { core::ptr::write_volatile(regs.add(off / 4), v) }
    }

    #[derive(Clone, Copy)]
    enum Script {
        /// Retires slot 0 after N polls and reports PRDBC.
        WellBehaved { complete_after: u32 },
        /// Raises TFD/SERR after N polls and never retires the slot.
        Fault { after: u32, tfd: u32, serr: u32 },
        /// Accepts the command and never completes it.
        Dead,
        /// Never even acknowledges the HBA reset.
        StuckReset,
    }

    /// Scripted device model: acts on the fake register file between
    /// poll iterations, standing in for the far side of the link.
    struct DeviceModel {
        regs: *mut u32,
        script: Script,
        polls_while_busy: u32,
        max_ci_bits: u32,
    }

    impl DeviceModel {
        fn new(regs: *mut u32, script: Script) -> Self {
            Self { regs, script, polls_while_busy: 0, max_ci_bits: 0 }
        }

        fn header_base(&self) -> u64 {
            let lo = reg_read(self.regs, P0 + regs::port::CLB) as u64;
            let hi = reg_read(self.regs, P0 + regs::port::CLBU) as u64;
            lo | (hi << 32)
        }

        fn step(&mut self) {
            let ghc = reg_read(self.regs, regs::host::GHC);
            if ghc & GHC_HR != 0 && !matches!(self.script, Script::StuckReset) {
                reg_write(self.regs, regs::host::GHC, ghc & !GHC_HR);
            }

            let ci = reg_read(self.regs, P0 + regs::port::CI);
            self.max_ci_bits = self.max_ci_bits.max(ci.count_ones());
            if ci & 1 == 0 {
                return;
            }
            self.polls_while_busy += 1;

            match self.script {
                Script::WellBehaved { complete_after }
                    if self.polls_while_busy >= complete_after =>
                {
                    unsafe {
                        let header = self.header_base() as *mut u32;
                        let ctba = core::ptr::read_volatile(header.add(2)) as u64
                            | ((core::ptr::read_volatile(header.add(3)) as u64) << 32);
                        let dbc_i = core::ptr::read_volatile((ctba as *const u32).add(0x8C / 4));
                        let bytes = (dbc_i & 0x003F_FFFF) + 1;
                        core::ptr::write_volatile(header.add(1), bytes);
                    }
                    reg_write(self.regs, P0 + regs::port::CI, ci & !1);
                }
                Script::Fault { after, tfd, serr } if self.polls_while_busy >= after => {
                    reg_write(self.regs, P0 + regs::port::TFD, tfd);
                    reg_write(self.regs, P0 + regs::port::SERR, serr);
                }
                _ => {}
            }
        }
    }

    impl WaitBudget for DeviceModel {
        fn wait_until(&mut self, budget: u32, cond: &mut dyn FnMut() -> bool) -> bool {
            for _ in 0..budget {
                self.step();
                if cond() {
                    return true;
                }
            }
            false
        }
    }

    fn fake_hba(script: Script) -> Hba<DeviceModel> {
        let regs_ptr = leak_regs();
        reg_write(regs_ptr, regs::host::CAP, 31 << 8); // 32 command slots
        reg_write(regs_ptr, regs::host::VS, 0x0001_0301);
        reg_write(regs_ptr, regs::host::PI, 1);
        reg_write(regs_ptr, P0 + regs::port::SSTS, 0x103); // DET=3, IPM=1
        reg_write(regs_ptr, P0 + regs::port::SIG, SATA_SIG_ATA);

        let model = DeviceModel::new(regs_ptr, script);
        unsafe { Hba::with_waiter(regs_ptr as u64, model) }
    }

    fn ready_hba(script: Script) -> Hba<DeviceModel> {
        let mut hba = fake_hba(script);
        hba.init().expect("init");
        hba
    }

    /// Stack buffer with the word alignment the HBA demands of DMA
    /// targets.
    #[repr(align(4))]
    struct DmaBuf<const N: usize>([u8; N]);

    impl<const N: usize> DmaBuf<N> {
        fn new() -> Self {
            Self([0u8; N])
        }
    }

    fn read_request(buf: &mut [u8], count: u16, timeout: u32) -> AtaDmaRequest<'_> {
        AtaDmaRequest {
            command: 0x25,
            lba: 0,
            sector_count: count,
            buffer: DmaBuffer::ToHost(buf),
            timeout,
        }
    }

    #[test]
    fn test_init_selects_first_established_port() {
        let hba = ready_hba(Script::WellBehaved { complete_after: 1 });
        assert_eq!(hba.active_port(), Some(0));
        assert_eq!(hba.port_phase(0), PortPhase::Running);
        assert_eq!(hba.command_slots(), 32);
    }

    #[test]
    fn test_init_fails_without_device() {
        let mut hba = fake_hba(Script::WellBehaved { complete_after: 1 });
        // Knock the link down before init.
        let regs_ptr = hba.mmio.base as *mut u32;
        reg_write(regs_ptr, P0 + regs::port::SSTS, 0);
        assert_eq!(hba.init(), Err(AhciError::NoDevice));
    }

    #[test]
    fn test_init_skips_satapi_port() {
        let mut hba = fake_hba(Script::WellBehaved { complete_after: 1 });
        let regs_ptr = hba.mmio.base as *mut u32;
        reg_write(regs_ptr, P0 + regs::port::SIG, SATA_SIG_ATAPI);
        assert_eq!(hba.init(), Err(AhciError::NoDevice));
    }

    #[test]
    fn test_reset_timeout_surfaces() {
        let mut hba = fake_hba(Script::StuckReset);
        assert_eq!(hba.init(), Err(AhciError::ResetTimeout));
    }

    #[test]
    fn test_read_completes_with_single_ci_bit() {
        let mut hba = ready_hba(Script::WellBehaved { complete_after: 3 });
        let mut buf = DmaBuf::<1024>::new();
        hba.issue_ata_dma(read_request(&mut buf.0, 2, 100)).expect("read");
        assert!(!hba.has_in_flight());
        // Command serialization: slot 0 only, never more than one bit.
        assert!(hba.waiter().max_ci_bits <= 1);
    }

    #[test]
    fn test_rejects_zero_and_oversized_counts() {
        let mut hba = ready_hba(Script::WellBehaved { complete_after: 1 });
        let mut buf = DmaBuf::<512>::new();
        assert_eq!(
            hba.issue_ata_dma(read_request(&mut buf.0, 0, 100)),
            Err(AhciError::BadParameter)
        );
        assert_eq!(
            hba.issue_ata_dma(read_request(&mut buf.0, config::MAX_SECTORS_PER_COMMAND + 1, 100)),
            Err(AhciError::BadParameter)
        );
    }

    #[test]
    fn test_rejects_short_buffer() {
        let mut hba = ready_hba(Script::WellBehaved { complete_after: 1 });
        let mut buf = DmaBuf::<512>::new();
        assert_eq!(
            hba.issue_ata_dma(read_request(&mut buf.0, 2, 100)),
            Err(AhciError::BadParameter)
        );
    }

    #[test]
    fn test_rejects_misaligned_buffer() {
        let mut hba = ready_hba(Script::WellBehaved { complete_after: 1 });
        let mut buf = DmaBuf::<1024>::new();
        assert_eq!(
            hba.issue_ata_dma(read_request(&mut buf.0[1..513], 1, 100)),
            Err(AhciError::BadParameter)
        );
    }

    #[test]
    fn test_busy_task_file_reports_device_busy() {
        let mut hba = ready_hba(Script::Dead);
        let regs_ptr = hba.mmio.base as *mut u32;
        reg_write(regs_ptr, P0 + regs::port::TFD, TFD_BSY);
        let mut buf = DmaBuf::<512>::new();
        assert_eq!(
            hba.issue_ata_dma(read_request(&mut buf.0, 1, 100)),
            Err(AhciError::DeviceBusy)
        );
        // DeviceBusy happens before issue and must not fault the port.
        assert_eq!(hba.port_phase(0), PortPhase::Running);
    }

    #[test]
    fn test_device_error_carries_tfd_and_serr() {
        let mut hba = ready_hba(Script::Fault { after: 1, tfd: 0x51, serr: 0xDEAD_BEEF });
        let mut buf = DmaBuf::<512>::new();
        let err = hba.issue_ata_dma(read_request(&mut buf.0, 1, 1000)).unwrap_err();
        assert_eq!(err, AhciError::DeviceError { tfd: 0x51, serr: 0xDEAD_BEEF });
        assert_eq!(hba.port_phase(0), PortPhase::Faulted);
        assert!(!hba.has_in_flight());

        // A follow-up command fails the same way without hanging and
        // without leaking an in-flight slot.
        let mut buf2 = DmaBuf::<512>::new();
        let again = hba.issue_ata_dma(read_request(&mut buf2.0, 1, 1000)).unwrap_err();
        assert_eq!(again, AhciError::DeviceError { tfd: 0x51, serr: 0xDEAD_BEEF });
        assert!(!hba.has_in_flight());
        assert!(hba.waiter().max_ci_bits <= 1);
    }

    #[test]
    fn test_timeout_faults_the_port() {
        let mut hba = ready_hba(Script::Dead);
        let mut buf = DmaBuf::<512>::new();
        assert_eq!(
            hba.issue_ata_dma(read_request(&mut buf.0, 1, 500)),
            Err(AhciError::Timeout)
        );
        assert_eq!(hba.port_phase(0), PortPhase::Faulted);
        assert!(!hba.has_in_flight());
    }

    #[test]
    fn test_write_sets_header_direction() {
        let mut hba = ready_hba(Script::WellBehaved { complete_after: 1 });
        let buf = DmaBuf::<512>::new();
        hba.issue_ata_dma(AtaDmaRequest {
            command: 0x35,
            lba: 8,
            sector_count: 1,
            buffer: DmaBuffer::FromHost(&buf.0),
            timeout: 100,
        })
        .expect("write");
        let header = &hba.mem.as_ref().unwrap().cmd_list.headers[0];
        assert!(header.flags & HDR_WRITE != 0);
        assert_eq!(header.flags & HDR_CFL_MASK, CFIS_DWORDS as u16);
        assert_eq!(header.prdtl, 1);
    }

    #[test]
    fn test_fis_carries_lba_and_count() {
        let mut hba = ready_hba(Script::WellBehaved { complete_after: 1 });
        let mut buf = DmaBuf::<1024>::new();
        hba.issue_ata_dma(AtaDmaRequest {
            command: 0x25,
            lba: 0x0001_0203_0405,
            sector_count: 2,
            buffer: DmaBuffer::ToHost(&mut buf.0),
            timeout: 100,
        })
        .expect("read");
        let fis = &hba.mem.as_ref().unwrap().table.cfis;
        assert_eq!(fis.fis_type, FisType::RegH2D as u8);
        assert_eq!(fis.pmport_c, 0x80);
        assert_eq!(fis.command, 0x25);
        assert_eq!(fis.device, 0x40);
        assert_eq!(
            [fis.lba0, fis.lba1, fis.lba2, fis.lba3, fis.lba4, fis.lba5],
            [0x05, 0x04, 0x03, 0x02, 0x01, 0x00]
        );
        assert_eq!([fis.countl, fis.counth], [2, 0]);
    }
}
