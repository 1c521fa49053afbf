//! Read-only HBA and port status inspection.
//!
//! Renders the same register map the driver programs, for diagnostics
//! and shell-level tooling. The command path never calls in here.

use alloc::format;
use alloc::string::String;

use super::ahci::{regs, Hba, WaitBudget};

/// One-line generic host control summary.
pub fn hba_summary<W: WaitBudget>(hba: &Hba<W>) -> String {
    let cap = hba.read_host_reg(regs::host::CAP);
    let ghc = hba.read_host_reg(regs::host::GHC);
    let pi = hba.read_host_reg(regs::host::PI);
    let vs = hba.read_host_reg(regs::host::VS);

    format!(
        "AHCI {}.{}: cap={:#010x} ghc={:#010x} pi={:#010x} slots={} ports={}",
        vs >> 16,
        vs & 0xFFFF,
        cap,
        ghc,
        pi,
        ((cap >> 8) & 0x1F) + 1,
        (cap & 0x1F) + 1
    )
}

/// Port status with decoded device-detection and power-management
/// fields.
pub fn port_summary<W: WaitBudget>(hba: &Hba<W>, port: usize) -> String {
    let sig = hba.read_port_reg(port, regs::port::SIG);
    let cmd = hba.read_port_reg(port, regs::port::CMD);
    let tfd = hba.read_port_reg(port, regs::port::TFD);
    let ssts = hba.read_port_reg(port, regs::port::SSTS);
    let serr = hba.read_port_reg(port, regs::port::SERR);
    let ci = hba.read_port_reg(port, regs::port::CI);

    let det = match ssts & 0xF {
        0 => "none",
        1 => "present",
        3 => "established",
        4 => "offline",
        _ => "?",
    };
    let ipm = match (ssts >> 8) & 0xF {
        0 => "none",
        1 => "active",
        2 => "partial",
        6 => "slumber",
        _ => "?",
    };

    format!(
        "port {} ({:?}): sig={:#010x} cmd={:#010x} tfd={:#010x} ssts={:#010x} \
         (det={} ipm={}) serr={:#010x} ci={:#010x}",
        port,
        hba.port_phase(port),
        sig,
        cmd,
        tfd,
        ssts,
        det,
        ipm,
        serr,
        ci
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ahci::{SpinWait, SATA_SIG_ATA};

    #[test]
    fn test_summaries_decode_registers() {
        // A passive register file is enough for read-only inspection.
        let regs_mem = Box::into_raw(Box::new([0u32; 0x200 / 4])) as *mut u32;
        unsafe {
            *regs_mem.add(regs::host::CAP / 4) = 31 << 8;
            *regs_mem.add(regs::host::VS / 4) = 0x0001_0301;
            *regs_mem.add(regs::host::PI / 4) = 1;
            *regs_mem.add((0x100 + regs::port::SSTS) / 4) = 0x103;
            *regs_mem.add((0x100 + regs::port::SIG) / 4) = SATA_SIG_ATA;
        }

        let hba = unsafe { Hba::with_waiter(regs_mem as u64, SpinWait) };
        let host = hba_summary(&hba);
        assert!(host.contains("slots=32"));

        let port = port_summary(&hba, 0);
        assert!(port.contains("det=established"));
        assert!(port.contains("ipm=active"));
        assert!(port.contains("sig=0x00000101"));
    }
}
