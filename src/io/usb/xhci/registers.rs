// ============================================================================
// src/io/usb/xhci/registers.rs - xHCI Register Access Layer
// ============================================================================
//!
//! xHCI の4つのレジスタブロック（Capability / Operational / Runtime /
//! Doorbell）への型付きアクセス。
//!
//! バスは32ビット単位でしかアクセスできない前提で、64ビットレジスタは
//! 下位ワード → 上位ワードの順に2回の32ビットアクセスへ分割する。

use alloc::sync::Arc;
use bitflags::bitflags;

// ============================================================================
// Register Offsets
// ============================================================================

/// Capability Registers (BAR0 基準)
pub mod cap {
    /// CAPLENGTH (byte 0) / HCIVERSION (bytes 2-3)
    pub const CAPLENGTH_HCIVERSION: u64 = 0x00;
    pub const HCSPARAMS1: u64 = 0x04;
    pub const HCSPARAMS2: u64 = 0x08;
    pub const HCCPARAMS1: u64 = 0x10;
    pub const DBOFF: u64 = 0x14;
    pub const RTSOFF: u64 = 0x18;
}

/// Operational Registers (BAR0 + CAPLENGTH 基準)
pub mod op {
    pub const USBCMD: u64 = 0x00;
    pub const USBSTS: u64 = 0x04;
    pub const PAGESIZE: u64 = 0x08;
    pub const CRCR: u64 = 0x18;
    pub const DCBAAP: u64 = 0x30;
    pub const CONFIG: u64 = 0x38;
    /// ポート0の PORTSC
    pub const PORTSC_BASE: u64 = 0x400;
    pub const PORT_REGISTER_STRIDE: u64 = 0x10;
}

/// Runtime Registers (BAR0 + RTSOFF 基準)
pub mod rt {
    /// Interrupter Register Set 0
    pub const IR0: u64 = 0x20;
    pub const IR_STRIDE: u64 = 0x20;
    pub const IMAN: u64 = 0x00;
    pub const IMOD: u64 = 0x04;
    pub const ERSTSZ: u64 = 0x08;
    pub const ERSTBA: u64 = 0x10;
    pub const ERDP: u64 = 0x18;
}

// ============================================================================
// Register Bits
// ============================================================================

bitflags! {
    /// USBCMD
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        /// Run/Stop
        const RUN = 1 << 0;
        /// Host Controller Reset
        const HCRST = 1 << 1;
        /// Interrupter Enable
        const INTE = 1 << 2;
        /// Host System Error Enable
        const HSEE = 1 << 3;
    }
}

bitflags! {
    /// USBSTS
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        /// HCHalted
        const HCH = 1 << 0;
        /// Host System Error
        const HSE = 1 << 2;
        /// Event Interrupt
        const EINT = 1 << 3;
        /// Port Change Detect
        const PCD = 1 << 4;
        /// Controller Not Ready
        const CNR = 1 << 11;
        /// Host Controller Error
        const HCE = 1 << 12;
    }
}

bitflags! {
    /// IMAN
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Iman: u32 {
        /// Interrupt Pending (RW1C)
        const IP = 1 << 0;
        /// Interrupt Enable
        const IE = 1 << 1;
    }
}

/// CRCR Ring Cycle State
pub const CRCR_RCS: u64 = 1 << 0;
/// ERDP Event Handler Busy (RW1C)
pub const ERDP_EHB: u64 = 1 << 3;

// ============================================================================
// Bus Access Capability
// ============================================================================

/// 32ビット単位のレジスタバスアクセス
///
/// アドレスは物理アドレス（BAR0 由来）そのもの。
pub trait RegisterIo {
    fn read32(&self, addr: u64) -> u32;
    fn write32(&self, addr: u64, value: u32);
}

impl<T: RegisterIo + ?Sized> RegisterIo for &T {
    fn read32(&self, addr: u64) -> u32 {
        (**self).read32(addr)
    }

    fn write32(&self, addr: u64, value: u32) {
        (**self).write32(addr, value)
    }
}

impl<T: RegisterIo + ?Sized> RegisterIo for Arc<T> {
    fn read32(&self, addr: u64) -> u32 {
        (**self).read32(addr)
    }

    fn write32(&self, addr: u64, value: u32) {
        (**self).write32(addr, value)
    }
}

/// アイデンティティマップされたMMIOへの volatile アクセス
#[derive(Debug)]
pub struct VolatileMmio {
    _private: (),
}

impl VolatileMmio {
    /// # Safety
    /// 以降このアクセサに渡されるアドレスは、マップ済みのデバイスレジスタで
    /// なければならない。
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl RegisterIo for VolatileMmio {
    fn read32(&self, addr: u64) -> u32 {
        // SAFETY: new() の契約によりマップ済みレジスタ
        unsafe { core::ptr::read_volatile(addr as *const u32) }
    }

    fn write32(&self, addr: u64, value: u32) {
        // SAFETY: new() の契約によりマップ済みレジスタ
        unsafe { core::ptr::write_volatile(addr as *mut u32, value) }
    }
}

/// 64ビットレジスタ読み取り（下位 → 上位）
pub fn read64<R: RegisterIo + ?Sized>(io: &R, addr: u64) -> u64 {
    let low = io.read32(addr) as u64;
    let high = io.read32(addr + 4) as u64;
    (high << 32) | low
}

/// 64ビットレジスタ書き込み（下位 → 上位）
pub fn write64<R: RegisterIo + ?Sized>(io: &R, addr: u64, value: u64) {
    io.write32(addr, value as u32);
    io.write32(addr + 4, (value >> 32) as u32);
}

// ============================================================================
// Register Blocks
// ============================================================================

/// コントローラのレジスタブロック群
pub struct XhciRegisters<R> {
    io: R,
    cap_base: u64,
    op_base: u64,
    rt_base: u64,
    db_base: u64,
}

impl<R: RegisterIo> XhciRegisters<R> {
    /// BAR0 からレジスタブロックの位置を求める
    pub fn new(io: R, mmio_base: u64) -> Self {
        let caplength = (io.read32(mmio_base + cap::CAPLENGTH_HCIVERSION) & 0xFF) as u64;
        let dboff = (io.read32(mmio_base + cap::DBOFF) & !0x3) as u64;
        let rtsoff = (io.read32(mmio_base + cap::RTSOFF) & !0x1F) as u64;

        Self {
            io,
            cap_base: mmio_base,
            op_base: mmio_base + caplength,
            rt_base: mmio_base + rtsoff,
            db_base: mmio_base + dboff,
        }
    }

    pub fn io(&self) -> &R {
        &self.io
    }

    pub fn cap_base(&self) -> u64 {
        self.cap_base
    }

    pub fn op_base(&self) -> u64 {
        self.op_base
    }

    pub fn rt_base(&self) -> u64 {
        self.rt_base
    }

    pub fn db_base(&self) -> u64 {
        self.db_base
    }

    // ---- Capability ----

    pub fn read_cap32(&self, offset: u64) -> u32 {
        self.io.read32(self.cap_base + offset)
    }

    // ---- Operational ----

    pub fn read_op32(&self, offset: u64) -> u32 {
        self.io.read32(self.op_base + offset)
    }

    pub fn write_op32(&self, offset: u64, value: u32) {
        self.io.write32(self.op_base + offset, value)
    }

    pub fn read_op64(&self, offset: u64) -> u64 {
        read64(&self.io, self.op_base + offset)
    }

    pub fn write_op64(&self, offset: u64, value: u64) {
        write64(&self.io, self.op_base + offset, value)
    }

    pub fn usbcmd(&self) -> UsbCmd {
        UsbCmd::from_bits_retain(self.read_op32(op::USBCMD))
    }

    pub fn set_usbcmd(&self, cmd: UsbCmd) {
        self.write_op32(op::USBCMD, cmd.bits())
    }

    pub fn usbsts(&self) -> UsbSts {
        UsbSts::from_bits_retain(self.read_op32(op::USBSTS))
    }

    // ---- Ports ----

    fn portsc_offset(port: u8) -> u64 {
        op::PORTSC_BASE + port as u64 * op::PORT_REGISTER_STRIDE
    }

    /// 0始まりのポートの PORTSC を読む
    pub fn read_portsc(&self, port: u8) -> u32 {
        self.read_op32(Self::portsc_offset(port))
    }

    pub fn write_portsc(&self, port: u8, value: u32) {
        self.write_op32(Self::portsc_offset(port), value)
    }

    // ---- Runtime / Interrupter ----

    fn interrupter_offset(interrupter: u16, reg: u64) -> u64 {
        rt::IR0 + interrupter as u64 * rt::IR_STRIDE + reg
    }

    pub fn read_ir32(&self, interrupter: u16, reg: u64) -> u32 {
        self.io.read32(self.rt_base + Self::interrupter_offset(interrupter, reg))
    }

    pub fn write_ir32(&self, interrupter: u16, reg: u64, value: u32) {
        self.io
            .write32(self.rt_base + Self::interrupter_offset(interrupter, reg), value)
    }

    pub fn read_ir64(&self, interrupter: u16, reg: u64) -> u64 {
        read64(&self.io, self.rt_base + Self::interrupter_offset(interrupter, reg))
    }

    pub fn write_ir64(&self, interrupter: u16, reg: u64, value: u64) {
        write64(&self.io, self.rt_base + Self::interrupter_offset(interrupter, reg), value)
    }

    // ---- Doorbell ----

    /// ドアベルを鳴らす（index 0 = コマンドリング、1.. = スロット）
    pub fn ring_doorbell(&self, index: u8, target: DoorbellTarget) {
        self.io.write32(self.db_base + index as u64 * 4, target.value());
    }
}

// ============================================================================
// Doorbell Targets
// ============================================================================

/// ドアベルレジスタの DB Target フィールド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoorbellTarget {
    /// ホストコントローラコマンド (doorbell 0 専用)
    Command,
    /// エンドポイント (DCI 1..=31)
    Endpoint(u8),
}

impl DoorbellTarget {
    /// コントロールエンドポイント (EP0, DCI 1)
    pub const CONTROL_EP0: Self = DoorbellTarget::Endpoint(1);

    pub fn value(&self) -> u32 {
        match self {
            DoorbellTarget::Command => 0,
            DoorbellTarget::Endpoint(dci) => (*dci & 0x1F) as u32,
        }
    }
}
