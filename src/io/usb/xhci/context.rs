// ============================================================================
// src/io/usb/xhci/context.rs - xHCI Device Context Structures
// ============================================================================
//!
//! xHCI デバイスコンテキスト関連の構造体定義。
//!
//! ## コンテキスト構造
//! - SlotContext: スロット状態（デバイス接続情報）
//! - EndpointContext: エンドポイント状態（転送設定）
//! - Device Context: スロット + 31 エンドポイント（コントローラが書く）
//! - Input Context: 入力制御 + スロット + 31 エンドポイント（ホストが書く）
//! - DCBAA: スロットIDごとのデバイスコンテキストへのポインタ配列
//!
//! コンテキストエントリは HCCPARAMS1.CSZ に応じて 32 または 64 バイト。
//! どちらの場合も使うのは先頭 32 バイトだけ。

use crate::error::MemoryError;
use crate::io::dma::{DmaAllocator, DmaBuffer, MIN_DMA_ALIGNMENT};
use crate::io::usb::{PortNumber, SlotId, UsbSpeed};

/// HCCPARAMS1 Context Size ビット
pub const HCCPARAMS1_CSZ: u32 = 1 << 2;

/// Device Context のエントリ数（スロット + 31 エンドポイント）
pub const DEVICE_CONTEXT_ENTRIES: usize = 32;
/// Input Context のエントリ数（入力制御 + Device Context）
pub const INPUT_CONTEXT_ENTRIES: usize = 33;

/// エンドポイントタイプ: Control
pub const EP_TYPE_CONTROL: u32 = 4;

// ============================================================================
// Context Layout
// ============================================================================

/// コンテキストのエントリサイズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLayout {
    entry_size: usize,
}

impl ContextLayout {
    pub const COMPACT: Self = Self { entry_size: 32 };
    pub const WIDE: Self = Self { entry_size: 64 };

    pub fn from_hccparams1(hccparams1: u32) -> Self {
        if hccparams1 & HCCPARAMS1_CSZ != 0 {
            Self::WIDE
        } else {
            Self::COMPACT
        }
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    pub fn device_context_size(&self) -> usize {
        DEVICE_CONTEXT_ENTRIES * self.entry_size
    }

    pub fn input_context_size(&self) -> usize {
        INPUT_CONTEXT_ENTRIES * self.entry_size
    }

    /// Device Context 内の DCI のオフセット（DCI 0 = スロット）
    pub fn device_offset(&self, dci: usize) -> usize {
        dci * self.entry_size
    }

    /// Input Context 内の DCI のオフセット（入力制御の分だけずれる）
    pub fn input_offset(&self, dci: usize) -> usize {
        (dci + 1) * self.entry_size
    }
}

// ============================================================================
// Context Entries
// ============================================================================

/// 8 ダブルワードのコンテキストエントリを DMA バッファへ書く
fn store(buffer: &mut DmaBuffer, offset: usize, dwords: &[u32; 8]) {
    for (i, dword) in dwords.iter().enumerate() {
        buffer.write_u32(offset + i * 4, *dword);
    }
}

fn load(buffer: &DmaBuffer, offset: usize) -> [u32; 8] {
    let mut dwords = [0u32; 8];
    for (i, dword) in dwords.iter_mut().enumerate() {
        *dword = buffer.read_u32(offset + i * 4);
    }
    dwords
}

/// 入力制御コンテキスト
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputControlContext {
    pub drop_flags: u32,
    pub add_flags: u32,
}

impl InputControlContext {
    /// スロット (A0) と EP0 (A1) を追加
    pub fn address_device() -> Self {
        Self {
            drop_flags: 0,
            add_flags: 0x3,
        }
    }

    fn to_dwords(self) -> [u32; 8] {
        let mut dwords = [0u32; 8];
        dwords[0] = self.drop_flags;
        dwords[1] = self.add_flags;
        dwords
    }
}

/// スロットコンテキスト
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotContext {
    pub dwords: [u32; 8],
}

impl SlotContext {
    /// ルートハブ直結デバイス用のスロットコンテキスト（Context Entries = 1）
    pub fn for_root_port(speed: UsbSpeed, port: PortNumber) -> Self {
        let mut ctx = Self::default();
        ctx.dwords[0] = (1 << 27) | ((speed.to_slot_speed() as u32) << 20);
        ctx.dwords[1] = (port.one_indexed() as u32) << 16;
        ctx
    }

    pub fn context_entries(&self) -> u8 {
        ((self.dwords[0] >> 27) & 0x1F) as u8
    }

    pub fn speed_code(&self) -> u8 {
        ((self.dwords[0] >> 20) & 0xF) as u8
    }

    /// ルートハブポート番号（1始まり）
    pub fn root_hub_port(&self) -> u8 {
        ((self.dwords[1] >> 16) & 0xFF) as u8
    }

    /// USBデバイスアドレス（コントローラが書く）
    pub fn device_address(&self) -> u8 {
        (self.dwords[3] & 0xFF) as u8
    }

    pub fn slot_state(&self) -> u8 {
        ((self.dwords[3] >> 27) & 0x1F) as u8
    }
}

/// エンドポイントコンテキスト
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointContext {
    pub dwords: [u32; 8],
}

impl EndpointContext {
    /// デフォルトコントロールエンドポイント (EP0)
    pub fn control(max_packet_size: u16, tr_dequeue: u64, dcs: bool) -> Self {
        let mut ctx = Self::default();
        // CErr = 3, EP Type = Control
        ctx.dwords[1] = (3 << 1) | (EP_TYPE_CONTROL << 3) | ((max_packet_size as u32) << 16);
        let dequeue = (tr_dequeue & !0xF) | dcs as u64;
        ctx.dwords[2] = dequeue as u32;
        ctx.dwords[3] = (dequeue >> 32) as u32;
        // Average TRB Length
        ctx.dwords[4] = 8;
        ctx
    }

    pub fn ep_type(&self) -> u8 {
        ((self.dwords[1] >> 3) & 0x7) as u8
    }

    pub fn error_count(&self) -> u8 {
        ((self.dwords[1] >> 1) & 0x3) as u8
    }

    pub fn max_packet_size(&self) -> u16 {
        (self.dwords[1] >> 16) as u16
    }

    pub fn tr_dequeue_pointer(&self) -> u64 {
        ((self.dwords[3] as u64) << 32) | (self.dwords[2] as u64 & !0xF)
    }

    pub fn dequeue_cycle_state(&self) -> bool {
        self.dwords[2] & 1 != 0
    }

    pub fn average_trb_length(&self) -> u16 {
        self.dwords[4] as u16
    }
}

// ============================================================================
// Context Buffers
// ============================================================================

/// Input Context（Address Device コマンドの入力）
#[derive(Debug)]
pub struct InputContext {
    buffer: DmaBuffer,
    layout: ContextLayout,
}

impl InputContext {
    pub fn allocate<A: DmaAllocator + ?Sized>(
        dma: &A,
        layout: ContextLayout,
    ) -> Result<Self, MemoryError> {
        Ok(Self {
            buffer: dma.allocate(layout.input_context_size(), MIN_DMA_ALIGNMENT)?,
            layout,
        })
    }

    pub fn release<A: DmaAllocator + ?Sized>(self, dma: &A) {
        dma.release(self.buffer);
    }

    pub fn phys_addr(&self) -> u64 {
        self.buffer.phys_addr()
    }

    pub fn set_control(&mut self, control: InputControlContext) {
        store(&mut self.buffer, 0, &control.to_dwords());
    }

    pub fn set_slot(&mut self, slot: SlotContext) {
        store(&mut self.buffer, self.layout.input_offset(0), &slot.dwords);
    }

    pub fn set_endpoint(&mut self, dci: usize, endpoint: EndpointContext) {
        store(&mut self.buffer, self.layout.input_offset(dci), &endpoint.dwords);
    }

    pub fn control(&self) -> InputControlContext {
        let dwords = load(&self.buffer, 0);
        InputControlContext {
            drop_flags: dwords[0],
            add_flags: dwords[1],
        }
    }

    pub fn slot(&self) -> SlotContext {
        SlotContext {
            dwords: load(&self.buffer, self.layout.input_offset(0)),
        }
    }

    pub fn endpoint(&self, dci: usize) -> EndpointContext {
        EndpointContext {
            dwords: load(&self.buffer, self.layout.input_offset(dci)),
        }
    }
}

/// Device Context（Output、コントローラが所有して更新する）
#[derive(Debug)]
pub struct DeviceContext {
    buffer: DmaBuffer,
    layout: ContextLayout,
}

impl DeviceContext {
    pub fn allocate<A: DmaAllocator + ?Sized>(
        dma: &A,
        layout: ContextLayout,
    ) -> Result<Self, MemoryError> {
        Ok(Self {
            buffer: dma.allocate(layout.device_context_size(), MIN_DMA_ALIGNMENT)?,
            layout,
        })
    }

    pub fn release<A: DmaAllocator + ?Sized>(self, dma: &A) {
        dma.release(self.buffer);
    }

    pub fn phys_addr(&self) -> u64 {
        self.buffer.phys_addr()
    }

    pub fn slot(&self) -> SlotContext {
        SlotContext {
            dwords: load(&self.buffer, self.layout.device_offset(0)),
        }
    }

    pub fn endpoint(&self, dci: usize) -> EndpointContext {
        EndpointContext {
            dwords: load(&self.buffer, self.layout.device_offset(dci)),
        }
    }
}

// ============================================================================
// Device Context Base Address Array
// ============================================================================

/// DCBAA
///
/// エントリ 0 はスクラッチパッド配列、1..=max_slots はデバイスコンテキスト。
#[derive(Debug)]
pub struct Dcbaa {
    buffer: DmaBuffer,
    entries: usize,
}

impl Dcbaa {
    pub fn allocate<A: DmaAllocator + ?Sized>(dma: &A, max_slots: u8) -> Result<Self, MemoryError> {
        let entries = max_slots as usize + 1;
        Ok(Self {
            buffer: dma.allocate(entries * 8, MIN_DMA_ALIGNMENT)?,
            entries,
        })
    }

    pub fn release<A: DmaAllocator + ?Sized>(self, dma: &A) {
        dma.release(self.buffer);
    }

    pub fn phys_addr(&self) -> u64 {
        self.buffer.phys_addr()
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn set_scratchpad(&mut self, array_addr: u64) {
        self.buffer.write_u64(0, array_addr);
    }

    pub fn scratchpad(&self) -> u64 {
        self.buffer.read_u64(0)
    }

    pub fn set(&mut self, slot_id: SlotId, device_context: u64) {
        self.buffer.write_u64(slot_id.as_usize() * 8, device_context);
    }

    pub fn clear(&mut self, slot_id: SlotId) {
        self.set(slot_id, 0);
    }

    pub fn get(&self, slot_id: SlotId) -> u64 {
        self.buffer.read_u64(slot_id.as_usize() * 8)
    }
}
