//! PCI bus scan for the AHCI controller.
//!
//! Enumerates the configuration space through the legacy CF8/CFC
//! address/data port pair (DWORD reads only) and returns the MMIO base
//! of the first SATA controller in AHCI mode.

use core::fmt;

/// PCI configuration ports
const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
const PCI_CONFIG_DATA: u16 = 0xCFC;

/// Class / subclass / prog-IF of a SATA controller in AHCI mode
const CLASS_MASS_STORAGE: u8 = 0x01;
const SUBCLASS_SATA: u8 = 0x06;
const PROG_IF_AHCI: u8 = 0x01;

/// Config-space offsets read by the scan
const REG_VENDOR_DEVICE: u8 = 0x00;
const REG_CLASS: u8 = 0x08;
const REG_BAR5: u8 = 0x24;

/// Location of a PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Read access to PCI configuration space.
pub trait ConfigAccess {
    /// Read the 32-bit dword at `offset` (4-byte aligned) of a function.
    fn read32(&mut self, addr: PciAddress, offset: u8) -> u32;
}

/// Legacy port-pair access (CF8/CFC). Enable bit is bit 31 of the
/// address dword.
#[cfg(target_arch = "x86_64")]
pub struct LegacyConfigPorts;

#[cfg(target_arch = "x86_64")]
impl ConfigAccess for LegacyConfigPorts {
    fn read32(&mut self, addr: PciAddress, offset: u8) -> u32 {
        use x86_64::instructions::port::Port;

        let address = (1u32 << 31)
            | ((addr.bus as u32) << 16)
            | ((addr.device as u32) << 11)
            | ((addr.function as u32) << 8)
            | ((offset as u32) & 0xFC);

        let mut addr_port = Port::<u32>::new(PCI_CONFIG_ADDRESS);
        let mut data_port = Port::<u32>::new(PCI_CONFIG_DATA);
        unsafe {
            addr_port.write(address);
            data_port.read()
        }
    }
}

/// A discovered AHCI controller: where it sits and its HBA MMIO base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AhciController {
    pub address: PciAddress,
    pub hba_base: u64,
}

/// Scan the whole bus for the first AHCI-class function.
///
/// Returns `None` when nothing matches; never fatal.
pub fn find_ahci_controller(access: &mut impl ConfigAccess) -> Option<AhciController> {
    for bus in 0..=255u8 {
        for device in 0..32u8 {
            for function in 0..8u8 {
                let addr = PciAddress { bus, device, function };

                let id = access.read32(addr, REG_VENDOR_DEVICE);
                if id & 0xFFFF == 0xFFFF {
                    continue;
                }

                let class_dword = access.read32(addr, REG_CLASS);
                let class = (class_dword >> 24) as u8;
                let subclass = (class_dword >> 16) as u8;
                let prog_if = (class_dword >> 8) as u8;
                if class != CLASS_MASS_STORAGE
                    || subclass != SUBCLASS_SATA
                    || prog_if != PROG_IF_AHCI
                {
                    continue;
                }

                let bar5 = access.read32(addr, REG_BAR5);
                if bar5 & 1 != 0 {
                    // ABAR must be memory-mapped
                    log::warn!("[PCI] AHCI controller at {} has an I/O-space BAR5", addr);
                    continue;
                }

                let hba_base = (bar5 & !0xFu32) as u64;
                log::debug!(
                    "[PCI] AHCI controller at {} (vendor {:04x}, ABAR {:#x})",
                    addr,
                    id & 0xFFFF,
                    hba_base
                );
                return Some(AhciController { address: addr, hba_base });
            }
        }
    }
    None
}

/// Scan using the legacy config ports.
#[cfg(target_arch = "x86_64")]
pub fn scan() -> Option<AhciController> {
    find_ahci_controller(&mut LegacyConfigPorts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct FakeConfig {
        map: BTreeMap<(u8, u8, u8, u8), u32>,
    }

    impl FakeConfig {
        fn new() -> Self {
            Self { map: BTreeMap::new() }
        }

        fn insert_function(&mut self, bus: u8, dev: u8, func: u8, class_dword: u32, bar5: u32) {
            self.map.insert((bus, dev, func, REG_VENDOR_DEVICE), 0x2922_8086);
            self.map.insert((bus, dev, func, REG_CLASS), class_dword);
            self.map.insert((bus, dev, func, REG_BAR5), bar5);
        }
    }

    impl ConfigAccess for FakeConfig {
        fn read32(&mut self, addr: PciAddress, offset: u8) -> u32 {
            *self
                .map
                .get(&(addr.bus, addr.device, addr.function, offset))
                .unwrap_or(&0xFFFF_FFFF)
        }
    }

    #[test]
    fn test_finds_ahci_function() {
        let mut cfg = FakeConfig::new();
        cfg.insert_function(0, 31, 2, 0x0106_0100, 0xFEBF_1000);

        let found = find_ahci_controller(&mut cfg).expect("controller");
        assert_eq!(found.address, PciAddress { bus: 0, device: 31, function: 2 });
        assert_eq!(found.hba_base, 0xFEBF_1000);
    }

    #[test]
    fn test_masks_bar_low_bits() {
        let mut cfg = FakeConfig::new();
        cfg.insert_function(0, 3, 0, 0x0106_0100, 0xFEBF_1008);

        let found = find_ahci_controller(&mut cfg).expect("controller");
        assert_eq!(found.hba_base, 0xFEBF_1000);
    }

    #[test]
    fn test_skips_io_space_bar() {
        let mut cfg = FakeConfig::new();
        cfg.insert_function(0, 3, 0, 0x0106_0100, 0x0000_C001);

        assert_eq!(find_ahci_controller(&mut cfg), None);
    }

    #[test]
    fn test_skips_non_ahci_storage() {
        let mut cfg = FakeConfig::new();
        // IDE controller: same class, different subclass/prog-IF
        cfg.insert_function(0, 1, 1, 0x0101_8000, 0xFEBF_1000);

        assert_eq!(find_ahci_controller(&mut cfg), None);
    }

    #[test]
    fn test_empty_bus_finds_nothing() {
        let mut cfg = FakeConfig::new();
        assert_eq!(find_ahci_controller(&mut cfg), None);
    }

    #[test]
    fn test_first_match_wins() {
        let mut cfg = FakeConfig::new();
        cfg.insert_function(0, 4, 0, 0x0106_0100, 0xFEB0_0000);
        cfg.insert_function(2, 0, 0, 0x0106_0100, 0xFEC0_0000);

        let found = find_ahci_controller(&mut cfg).expect("controller");
        assert_eq!(found.address.bus, 0);
        assert_eq!(found.hba_base, 0xFEB0_0000);
    }
}
