// ============================================================================
// src/io/pci/bus.rs - PCI Bus Enumeration
// ============================================================================
//!
//! PCI バスの総当たり走査 (bus 0-255 / device 0-31 / function 0-7)。

use log::{debug, info};

use super::traits::PciConfigRead;
use super::types::{BAR_MEMORY_MASK, BdfAddress, ClassCode, INVALID_VENDOR_ID, bar_is_64bit, config_regs};

/// 走査で見つかったファンクション
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciFunction {
    /// BDFアドレス
    pub bdf: BdfAddress,
    /// ベンダーID
    pub vendor_id: u16,
    /// デバイスID
    pub device_id: u16,
    /// クラスコード
    pub class_code: ClassCode,
    /// BAR0 のメモリベース（64ビットBARなら上位も結合済み）
    pub bar0: u64,
}

/// 全ファンクションを走査し、`class` に一致する最初のファンクションを返す
pub fn find_by_class<P: PciConfigRead + ?Sized>(pci: &P, class: ClassCode) -> Option<PciFunction> {
    for bus in 0..=255u8 {
        for device in 0..32u8 {
            for function in 0..8u8 {
                let bdf = BdfAddress::new(bus, device, function);
                let id = pci.read_dword(bdf, config_regs::VENDOR_DEVICE);
                let vendor_id = (id & 0xFFFF) as u16;
                if vendor_id == INVALID_VENDOR_ID {
                    continue;
                }

                let class_code = pci.read_class_code(bdf);
                if class_code != class {
                    continue;
                }

                let bar0 = read_bar0(pci, bdf);
                info!("PCI: found {:02x}:{:02x}:{:02x} at {} (BAR0 {:#x})",
                    class.class, class.subclass, class.prog_if, bdf, bar0);
                return Some(PciFunction {
                    bdf,
                    vendor_id,
                    device_id: (id >> 16) as u16,
                    class_code,
                    bar0,
                });
            }
        }
    }
    debug!("PCI: no function with class {:02x}:{:02x}:{:02x}", class.class, class.subclass, class.prog_if);
    None
}

/// BAR0 のメモリベースアドレスを読み取る
pub fn read_bar0<P: PciConfigRead + ?Sized>(pci: &P, bdf: BdfAddress) -> u64 {
    let low = pci.read_dword(bdf, config_regs::BAR0);
    let mut base = (low & BAR_MEMORY_MASK) as u64;
    if bar_is_64bit(low) {
        base |= (pci.read_dword(bdf, config_regs::BAR1) as u64) << 32;
    }
    base
}
