// ============================================================================
// src/io/pci/types.rs - PCI Type Definitions
// ============================================================================
//!
//! PCI 共通型定義
//!
//! Newtype パターンによるBDF管理とコンフィグ空間レジスタ定義。

use core::fmt;

/// BDF (Bus/Device/Function) アドレス
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct BdfAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl BdfAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device: device & 0x1F,
            function: function & 0x07,
        }
    }

    /// Legacy I/O アドレス (CONFIG_ADDRESS) を計算
    pub fn legacy_address(&self, offset: u8) -> u32 {
        ((self.bus as u32) << 16)
            | ((self.device as u32) << 11)
            | ((self.function as u32) << 8)
            | ((offset as u32) & 0xFC)
            | 0x8000_0000 // Enable bit
    }
}

impl fmt::Display for BdfAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.bus, self.device, self.function)
    }
}

/// コンフィグ空間レジスタオフセット（32ビット境界）
pub mod config_regs {
    /// Vendor ID (下位16ビット) / Device ID (上位16ビット)
    pub const VENDOR_DEVICE: u8 = 0x00;
    /// Revision / ProgIF / Subclass / Class
    pub const CLASS_REVISION: u8 = 0x08;
    pub const BAR0: u8 = 0x10;
    pub const BAR1: u8 = 0x14;
}

/// 存在しないファンクションのベンダーID
pub const INVALID_VENDOR_ID: u16 = 0xFFFF;

/// クラスコード（Class/Subclass/ProgIF）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ClassCode {
    /// クラスコード
    pub class: u8,
    /// サブクラスコード
    pub subclass: u8,
    /// プログラミングインターフェース
    pub prog_if: u8,
}

impl ClassCode {
    /// Serial Bus Controller / USB / xHCI
    pub const XHCI: Self = Self::new(0x0C, 0x03, 0x30);

    pub const fn new(class: u8, subclass: u8, prog_if: u8) -> Self {
        Self {
            class,
            subclass,
            prog_if,
        }
    }

    /// 32ビットクラスコードレジスタ (offset 0x08) から作成
    pub fn from_register(class_reg: u32) -> Self {
        Self {
            class: ((class_reg >> 24) & 0xFF) as u8,
            subclass: ((class_reg >> 16) & 0xFF) as u8,
            prog_if: ((class_reg >> 8) & 0xFF) as u8,
        }
    }

    /// USB xHCIコントローラかどうか
    pub fn is_xhci(&self) -> bool {
        *self == Self::XHCI
    }
}

/// メモリBARのアドレスマスク（下位4ビットは種別フラグ）
pub const BAR_MEMORY_MASK: u32 = 0xFFFF_FFF0;

/// BAR種別 (bits 2:1) が 64ビットメモリか
pub fn bar_is_64bit(bar: u32) -> bool {
    (bar & 0x1) == 0 && ((bar >> 1) & 0x3) == 0x2
}
