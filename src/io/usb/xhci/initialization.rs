// ============================================================================
// src/io/usb/xhci/initialization.rs - xHCI Controller Initialization
// ============================================================================
//!
//! xHCI コントローラの初期化シーケンス。
//!
//! ## 初期化フロー
//! 1. ケーパビリティレジスタ読み取り
//! 2. コントローラ停止・リセット
//! 3. 構造体（DCBAA, スクラッチパッド, コマンドリング, イベントリング）設定
//! 4. コントローラ開始

use alloc::vec::Vec;
use log::{debug, info};

use super::XhciConfig;
use super::context::{ContextLayout, Dcbaa};
use super::registers::{ERDP_EHB, Iman, RegisterIo, UsbCmd, UsbSts, XhciRegisters, cap, op, rt};
use super::ring_manager::{CommandRing, EventRing};
use super::wait::{WaitPolicy, WaitStage, poll_register};
use crate::error::MemoryError;
use crate::io::dma::{DmaAllocator, DmaBuffer, MIN_DMA_ALIGNMENT};
use crate::io::usb::UsbResult;

/// 使用するインタラプタ
pub const PRIMARY_INTERRUPTER: u16 = 0;

// ============================================================================
// Capabilities
// ============================================================================

/// xHCI ケーパビリティ情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XhciCapabilities {
    /// Capability Registers の長さ
    pub cap_length: u8,
    /// HCI バージョン
    pub hci_version: u16,
    /// 最大スロット数
    pub max_slots: u8,
    /// 最大インタラプタ数
    pub max_interrupters: u16,
    /// 最大ポート数
    pub max_ports: u8,
    /// スクラッチパッドバッファ数
    pub scratchpad_buffers: u16,
    /// 64ビットアドレッシングサポート
    pub ac64: bool,
    /// コンテキストエントリのサイズ
    pub context_layout: ContextLayout,
    /// ページサイズ（バイト）
    pub page_size: usize,
}

impl XhciCapabilities {
    /// ケーパビリティレジスタを読み取り
    pub fn read<R: RegisterIo>(regs: &XhciRegisters<R>) -> Self {
        let first = regs.read_cap32(cap::CAPLENGTH_HCIVERSION);
        let hcsparams1 = regs.read_cap32(cap::HCSPARAMS1);
        let hcsparams2 = regs.read_cap32(cap::HCSPARAMS2);
        let hccparams1 = regs.read_cap32(cap::HCCPARAMS1);
        let pagesize = regs.read_op32(op::PAGESIZE) & 0xFFFF;

        let scratchpad_hi = (hcsparams2 >> 21) & 0x1F;
        let scratchpad_lo = (hcsparams2 >> 27) & 0x1F;

        // PAGESIZE のビット n は 2^(n+12) バイトを示す
        let page_size = if pagesize == 0 {
            4096
        } else {
            1usize << (pagesize.trailing_zeros() + 12)
        };

        Self {
            cap_length: (first & 0xFF) as u8,
            hci_version: (first >> 16) as u16,
            max_slots: (hcsparams1 & 0xFF) as u8,
            max_interrupters: ((hcsparams1 >> 8) & 0x7FF) as u16,
            max_ports: ((hcsparams1 >> 24) & 0xFF) as u8,
            scratchpad_buffers: ((scratchpad_hi << 5) | scratchpad_lo) as u16,
            ac64: hccparams1 & 0x01 != 0,
            context_layout: ContextLayout::from_hccparams1(hccparams1),
            page_size,
        }
    }

    /// HCI バージョン（例: 0x0110 → (1, 10)）
    pub fn version(&self) -> (u8, u8) {
        let major = (self.hci_version >> 8) as u8;
        let minor = (self.hci_version & 0xFF) as u8;
        (major, (minor >> 4) * 10 + (minor & 0xF))
    }
}

/// コントローラのライフサイクル状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    Resetting,
    Ready,
    Running,
    Failed,
}

// ============================================================================
// Controller Memory
// ============================================================================

/// スクラッチパッド（配列 + ページ）
#[derive(Debug)]
pub struct Scratchpad {
    array: DmaBuffer,
    pages: Vec<DmaBuffer>,
}

impl Scratchpad {
    pub fn allocate<A: DmaAllocator + ?Sized>(
        dma: &A,
        count: u16,
        page_size: usize,
    ) -> Result<Self, MemoryError> {
        let mut array = dma.allocate(count as usize * 8, MIN_DMA_ALIGNMENT)?;
        let mut pages = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            match dma.allocate(page_size, page_size) {
                Ok(page) => {
                    array.write_u64(i * 8, page.phys_addr());
                    pages.push(page);
                }
                Err(e) => {
                    for page in pages {
                        dma.release(page);
                    }
                    dma.release(array);
                    return Err(e);
                }
            }
        }
        Ok(Self { array, pages })
    }

    pub fn release<A: DmaAllocator + ?Sized>(self, dma: &A) {
        for page in self.pages {
            dma.release(page);
        }
        dma.release(self.array);
    }

    pub fn array_address(&self) -> u64 {
        self.array.phys_addr()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// コントローラが共有するDMA構造体一式
#[derive(Debug)]
pub struct ControllerMemory {
    pub dcbaa: Dcbaa,
    pub scratchpad: Option<Scratchpad>,
    pub command_ring: CommandRing,
    pub event_ring: EventRing,
}

impl ControllerMemory {
    /// すべて確保する。途中で失敗したらそれまでの確保分を返却する。
    pub fn allocate<A: DmaAllocator + ?Sized>(
        dma: &A,
        caps: &XhciCapabilities,
        config: &XhciConfig,
    ) -> Result<Self, MemoryError> {
        let mut dcbaa = Dcbaa::allocate(dma, caps.max_slots)?;

        let scratchpad = if caps.scratchpad_buffers > 0 {
            match Scratchpad::allocate(dma, caps.scratchpad_buffers, caps.page_size) {
                Ok(scratchpad) => {
                    dcbaa.set_scratchpad(scratchpad.array_address());
                    Some(scratchpad)
                }
                Err(e) => {
                    dcbaa.release(dma);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let command_ring = match CommandRing::allocate(dma, config.ring_size) {
            Ok(ring) => ring,
            Err(e) => {
                if let Some(scratchpad) = scratchpad {
                    scratchpad.release(dma);
                }
                dcbaa.release(dma);
                return Err(e);
            }
        };

        let event_ring = match EventRing::allocate(dma, config.ring_size) {
            Ok(ring) => ring,
            Err(e) => {
                command_ring.release(dma);
                if let Some(scratchpad) = scratchpad {
                    scratchpad.release(dma);
                }
                dcbaa.release(dma);
                return Err(e);
            }
        };

        Ok(Self {
            dcbaa,
            scratchpad,
            command_ring,
            event_ring,
        })
    }

    pub fn release<A: DmaAllocator + ?Sized>(self, dma: &A) {
        self.event_ring.release(dma);
        self.command_ring.release(dma);
        if let Some(scratchpad) = self.scratchpad {
            scratchpad.release(dma);
        }
        self.dcbaa.release(dma);
    }
}

// ============================================================================
// Reset / Start
// ============================================================================

/// コントローラを停止してリセット
///
/// RUN をクリア → HCH 待ち → HCRST → HCRST 自動クリア待ち → CNR クリア待ち
pub fn reset_controller<R: RegisterIo, W: WaitPolicy + ?Sized>(
    regs: &XhciRegisters<R>,
    wait: &W,
) -> UsbResult<()> {
    let cmd = regs.usbcmd();
    regs.set_usbcmd(cmd - UsbCmd::RUN);
    poll_register(
        wait,
        WaitStage::ControllerHalt,
        || regs.read_op32(op::USBSTS),
        |sts| UsbSts::from_bits_retain(sts).contains(UsbSts::HCH),
    )?;
    debug!("xHCI: controller halted");

    let cmd = regs.usbcmd();
    regs.set_usbcmd(cmd | UsbCmd::HCRST);
    poll_register(
        wait,
        WaitStage::ControllerReset,
        || regs.read_op32(op::USBCMD),
        |cmd| !UsbCmd::from_bits_retain(cmd).contains(UsbCmd::HCRST),
    )?;

    poll_register(
        wait,
        WaitStage::ControllerReady,
        || regs.read_op32(op::USBSTS),
        |sts| !UsbSts::from_bits_retain(sts).contains(UsbSts::CNR),
    )?;
    debug!("xHCI: controller reset complete");
    Ok(())
}

/// 構造体アドレスをレジスタへ設定
///
/// ERSTBA への書き込みでイベントリングが有効になるため、最後に書く。
pub fn program_controller<R: RegisterIo>(
    regs: &XhciRegisters<R>,
    caps: &XhciCapabilities,
    memory: &ControllerMemory,
) {
    regs.write_op64(op::DCBAAP, memory.dcbaa.phys_addr());

    let config = regs.read_op32(op::CONFIG);
    regs.write_op32(op::CONFIG, (config & !0xFF) | caps.max_slots as u32);

    regs.write_op64(op::CRCR, memory.command_ring.crcr_value());

    let event_ring = &memory.event_ring;
    regs.write_ir32(PRIMARY_INTERRUPTER, rt::ERSTSZ, event_ring.erst_size());
    regs.write_ir64(
        PRIMARY_INTERRUPTER,
        rt::ERDP,
        event_ring.segment_base() | ERDP_EHB,
    );
    regs.write_ir64(PRIMARY_INTERRUPTER, rt::ERSTBA, event_ring.erst_address());

    let iman = regs.read_ir32(PRIMARY_INTERRUPTER, rt::IMAN);
    regs.write_ir32(
        PRIMARY_INTERRUPTER,
        rt::IMAN,
        iman | (Iman::IP | Iman::IE).bits(),
    );
}

/// RUN をセットして HCH がクリアされるのを待つ
pub fn run_controller<R: RegisterIo, W: WaitPolicy + ?Sized>(
    regs: &XhciRegisters<R>,
    wait: &W,
) -> UsbResult<()> {
    let cmd = regs.usbcmd();
    regs.set_usbcmd(cmd | UsbCmd::RUN | UsbCmd::INTE);
    poll_register(
        wait,
        WaitStage::ControllerStart,
        || regs.read_op32(op::USBSTS),
        |sts| !UsbSts::from_bits_retain(sts).contains(UsbSts::HCH),
    )?;
    info!("xHCI: controller running");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::dma::KernelHeapDma;
    use core::cell::Cell;
    use spin::Mutex;

    struct CapBus {
        hcsparams2: u32,
        hccparams1: u32,
        pagesize: u32,
    }

    impl RegisterIo for CapBus {
        fn read32(&self, addr: u64) -> u32 {
            match addr {
                0x00 => 0x0110_0020,
                0x04 => (8 << 24) | (1 << 8) | 32,
                0x08 => self.hcsparams2,
                0x10 => self.hccparams1,
                0x28 => self.pagesize,
                _ => 0,
            }
        }

        fn write32(&self, _addr: u64, _value: u32) {}
    }

    #[test]
    fn test_capabilities_decode() {
        let regs = XhciRegisters::new(
            CapBus {
                hcsparams2: (1 << 21) | (2 << 27),
                hccparams1: 0x5,
                pagesize: 0x1,
            },
            0,
        );
        let caps = XhciCapabilities::read(&regs);
        assert_eq!(caps.cap_length, 0x20);
        assert_eq!(caps.version(), (1, 10));
        assert_eq!(caps.max_slots, 32);
        assert_eq!(caps.max_interrupters, 1);
        assert_eq!(caps.max_ports, 8);
        assert_eq!(caps.scratchpad_buffers, 34);
        assert!(caps.ac64);
        assert_eq!(caps.context_layout, ContextLayout::WIDE);
        assert_eq!(caps.page_size, 4096);
    }

    /// HCH が立たないまま固まったコントローラ
    struct StuckBus {
        writes: Mutex<Vec<(u64, u32)>>,
    }

    impl RegisterIo for StuckBus {
        fn read32(&self, addr: u64) -> u32 {
            if addr == 0 { 0x20 } else { 0 }
        }

        fn write32(&self, addr: u64, value: u32) {
            self.writes.lock().push((addr, value));
        }
    }

    struct CountingWait {
        delays: Cell<u32>,
    }

    impl WaitPolicy for CountingWait {
        fn budget(&self) -> u32 {
            1000
        }

        fn delay(&self) {
            self.delays.set(self.delays.get() + 1);
        }
    }

    #[test]
    fn test_reset_timeout_on_halt() {
        let regs = XhciRegisters::new(StuckBus { writes: Mutex::new(Vec::new()) }, 0);
        let wait = CountingWait { delays: Cell::new(0) };
        let err = reset_controller(&regs, &wait).unwrap_err();
        assert_eq!(
            err,
            crate::io::usb::UsbError::Timeout { stage: WaitStage::ControllerHalt, last: 0 }
        );
        assert_eq!(wait.delays.get(), 1000);
        // RUN クリアの書き込みだけが行われ、HCRST は書かれない
        assert_eq!(regs.io().writes.lock().as_slice(), &[(0x20, 0)]);
    }

    #[test]
    fn test_memory_allocation_with_scratchpad() {
        let dma = KernelHeapDma::new();
        let caps = XhciCapabilities {
            cap_length: 0x20,
            hci_version: 0x0100,
            max_slots: 8,
            max_interrupters: 1,
            max_ports: 4,
            scratchpad_buffers: 2,
            ac64: true,
            context_layout: ContextLayout::COMPACT,
            page_size: 4096,
        };
        let memory = ControllerMemory::allocate(&dma, &caps, &XhciConfig::default()).unwrap();
        let scratchpad = memory.scratchpad.as_ref().unwrap();
        assert_eq!(scratchpad.page_count(), 2);
        assert_eq!(memory.dcbaa.entries(), 9);
        memory.release(&dma);
    }
}
