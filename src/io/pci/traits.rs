// ============================================================================
// src/io/pci/traits.rs - PCI Configuration Space Read Capability
// ============================================================================
//!
//! PCI コンフィグ空間の読み取りケーパビリティ。
//!
//! Legacy I/O ポートアクセスとテスト用の偽実装を同一のインターフェースで扱う。

use super::types::{BdfAddress, ClassCode, INVALID_VENDOR_ID, config_regs};

/// PCI Configuration Space 読み取りトレイト
pub trait PciConfigRead {
    /// 32ビット境界のコンフィグワードを読み取る
    fn read_config(&self, bus: u8, device: u8, function: u8, offset: u8) -> u32;

    // ========================================================================
    // Convenience methods with default implementations
    // ========================================================================

    /// BDF 指定の読み取り
    fn read_dword(&self, bdf: BdfAddress, offset: u8) -> u32 {
        self.read_config(bdf.bus, bdf.device, bdf.function, offset)
    }

    /// ベンダーIDを読み取り
    fn read_vendor_id(&self, bdf: BdfAddress) -> u16 {
        (self.read_dword(bdf, config_regs::VENDOR_DEVICE) & 0xFFFF) as u16
    }

    /// デバイスが存在するか確認
    fn device_exists(&self, bdf: BdfAddress) -> bool {
        self.read_vendor_id(bdf) != INVALID_VENDOR_ID
    }

    /// クラスコードを読み取り
    fn read_class_code(&self, bdf: BdfAddress) -> ClassCode {
        ClassCode::from_register(self.read_dword(bdf, config_regs::CLASS_REVISION))
    }
}

impl<T: PciConfigRead + ?Sized> PciConfigRead for &T {
    fn read_config(&self, bus: u8, device: u8, function: u8, offset: u8) -> u32 {
        (**self).read_config(bus, device, function, offset)
    }
}
