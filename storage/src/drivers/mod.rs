//! Hardware drivers for the storage stack.

pub mod ahci;
pub mod ata;
pub mod inspect;
pub mod partition;

#[cfg(target_arch = "x86_64")]
use crate::drivers::ahci::AhciError;
#[cfg(target_arch = "x86_64")]
use crate::drivers::ata::AtaDrive;

/// Locate the AHCI controller, bring up its first active port, and
/// identify the attached drive.
#[cfg(target_arch = "x86_64")]
pub fn probe_storage() -> Result<AtaDrive, AhciError> {
    let controller = crate::pci::scan().ok_or(AhciError::NoController)?;
    log::debug!(
        "[DRIVERS] AHCI controller at {} (HBA base {:#x})",
        controller.address,
        controller.hba_base
    );

    let mut hba = unsafe { ahci::Hba::new(controller.hba_base) };
    hba.init()?;
    AtaDrive::open(hba)
}
