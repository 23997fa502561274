// ============================================================================
// src/io/pci/legacy.rs - Legacy PCI I/O Port Access
// ============================================================================
//!
//! Legacy PCI Configuration Space アクセス (I/O ポートベース)
//!
//! 従来の PCI 2.x 方式の CF8h/CFCh ポートを使用した Configuration Space アクセス。

use super::traits::PciConfigRead;
use super::types::BdfAddress;
use spin::Mutex;
use x86_64::instructions::port::Port;

/// PCI configuration address port
const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
/// PCI configuration data port
const PCI_CONFIG_DATA: u16 = 0xCFC;

/// Legacy PCI I/O ポート対（アドレス書き込みとデータ読み取りは不可分）
struct LegacyPciPorts {
    address_port: Port<u32>,
    data_port: Port<u32>,
}

impl LegacyPciPorts {
    const fn new() -> Self {
        Self {
            address_port: Port::new(PCI_CONFIG_ADDRESS),
            data_port: Port::new(PCI_CONFIG_DATA),
        }
    }
}

static LEGACY_PCI: Mutex<LegacyPciPorts> = Mutex::new(LegacyPciPorts::new());

/// Legacy PCI Configuration Space アクセサ
#[derive(Clone, Copy, Debug, Default)]
pub struct LegacyPciAccessor;

impl LegacyPciAccessor {
    pub const fn new() -> Self {
        Self
    }
}

impl PciConfigRead for LegacyPciAccessor {
    fn read_config(&self, bus: u8, device: u8, function: u8, offset: u8) -> u32 {
        let address = BdfAddress::new(bus, device, function).legacy_address(offset);
        let mut ports = LEGACY_PCI.lock();
        // SAFETY: CF8/CFC は標準のPCIコンフィグポート、ロックで直列化
        unsafe {
            ports.address_port.write(address);
            ports.data_port.read()
        }
    }
}
