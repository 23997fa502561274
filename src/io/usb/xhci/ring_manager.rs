// ============================================================================
// src/io/usb/xhci/ring_manager.rs - xHCI Ring Management
// ============================================================================
//!
//! # xHCI リング管理
//!
//! コマンドリング、イベントリング、転送リングの管理を担当。
//! TRBのエンキュー/デキュー、サイクルビット管理を行う。
//!
//! ## サイクルビット
//! TRB のサイクルビットがリングの期待サイクル状態と一致するときだけ、
//! そのスロットは「生産済み・未消費」。インデックスがリングサイズに
//! 達すると 0 に戻り、サイクル状態が反転する。
//!
//! 生産者リング（コマンド/転送）は論理サイズの直後に Link TRB を1つ
//! 常駐させ、コントローラ側も同じ位置で先頭へ戻れるようにする。

use core::sync::atomic::{Ordering, fence};

use super::registers::{CRCR_RCS, DoorbellTarget, ERDP_EHB, RegisterIo, XhciRegisters};
use super::trb::{ErstEntry, TRB_CYCLE, Trb};
use crate::error::MemoryError;
use crate::io::dma::{DmaAllocator, DmaBuffer, PAGE_ALIGNMENT};

// ============================================================================
// Constants
// ============================================================================

/// TRBサイズ（バイト）
pub const TRB_SIZE: usize = 16;

/// コマンドリングサイズ
pub const COMMAND_RING_SIZE: usize = 256;

/// イベントリングサイズ
pub const EVENT_RING_SIZE: usize = 256;

/// 転送リングサイズ
pub const TRANSFER_RING_SIZE: usize = 256;

/// ERST アライメント
const ERST_ALIGNMENT: usize = 64;

// ============================================================================
// Generic TRB Ring
// ============================================================================

/// DMAメモリ上の TRB リング
#[derive(Debug)]
pub struct TrbRing {
    /// TRB 配列（Link TRB つきなら size + 1 エントリ）
    buffer: DmaBuffer,
    /// 論理リングサイズ
    size: usize,
    /// 生産者インデックス
    enqueue_index: usize,
    /// 消費者インデックス
    dequeue_index: usize,
    /// 現在のサイクル状態（生産者なら書くビット、消費者なら期待するビット）
    cycle_state: bool,
    /// 末尾に Link TRB を持つか
    has_link: bool,
}

impl TrbRing {
    /// ゼロ初期化済みのリングを確保（サイクル状態 1、インデックス 0）
    pub fn allocate<A: DmaAllocator + ?Sized>(
        dma: &A,
        size: usize,
        with_link: bool,
    ) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }
        let entries = if with_link { size + 1 } else { size };
        let buffer = dma.allocate(entries * TRB_SIZE, PAGE_ALIGNMENT)?;

        let mut ring = Self {
            buffer,
            size,
            enqueue_index: 0,
            dequeue_index: 0,
            cycle_state: true,
            has_link: with_link,
        };
        if with_link {
            // Link TRB のサイクルビットは最初の周回の間 0（未生産）
            let link = Trb::link(ring.base(), true);
            ring.write_trb(size, link);
        }
        Ok(ring)
    }

    /// メモリを返却
    pub fn release<A: DmaAllocator + ?Sized>(self, dma: &A) {
        dma.release(self.buffer);
    }

    /// リング先頭の物理アドレス
    pub fn base(&self) -> u64 {
        self.buffer.phys_addr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn enqueue_index(&self) -> usize {
        self.enqueue_index
    }

    pub fn dequeue_index(&self) -> usize {
        self.dequeue_index
    }

    pub fn cycle_state(&self) -> bool {
        self.cycle_state
    }

    /// インデックスの TRB の物理アドレス
    pub fn trb_address(&self, index: usize) -> u64 {
        self.base() + (index * TRB_SIZE) as u64
    }

    /// TRB を読み取る（control を先に読む）
    pub fn read_trb(&self, index: usize) -> Trb {
        let offset = index * TRB_SIZE;
        let control = self.buffer.read_u32(offset + 12);
        fence(Ordering::Acquire);
        Trb {
            parameter: self.buffer.read_u64(offset),
            status: self.buffer.read_u32(offset + 8),
            control,
        }
    }

    /// TRB を書き込む（サイクルビットを含む control を最後に書く）
    pub(crate) fn write_trb(&mut self, index: usize, trb: Trb) {
        let offset = index * TRB_SIZE;
        self.buffer.write_u64(offset, trb.parameter);
        self.buffer.write_u32(offset + 8, trb.status);
        fence(Ordering::Release);
        self.buffer.write_u32(offset + 12, trb.control);
    }

    /// 生産: 現在のサイクル状態を OR してエンキューし、TRB のアドレスを返す
    ///
    /// 満杯検出は行わない。
    pub fn push(&mut self, mut trb: Trb) -> u64 {
        let index = self.enqueue_index;
        trb.set_cycle_bit(self.cycle_state);
        self.write_trb(index, trb);
        let address = self.trb_address(index);

        self.enqueue_index += 1;
        if self.enqueue_index == self.size {
            if self.has_link {
                // コントローラに Link TRB を渡してから周回
                let mut link = self.read_trb(self.size);
                link.set_cycle_bit(self.cycle_state);
                self.write_trb(self.size, link);
            }
            self.enqueue_index = 0;
            self.cycle_state = !self.cycle_state;
        }
        address
    }

    /// 消費: サイクルビットが一致するときだけ取り出して進める
    pub fn pop(&mut self) -> Option<Trb> {
        let trb = self.read_trb(self.dequeue_index);
        if trb.cycle_bit() != self.cycle_state {
            return None;
        }

        self.dequeue_index += 1;
        if self.dequeue_index == self.size {
            self.dequeue_index = 0;
            self.cycle_state = !self.cycle_state;
        }
        Some(trb)
    }
}

// ============================================================================
// Command Ring
// ============================================================================

/// コマンドリング（ホスト → コントローラ）
#[derive(Debug)]
pub struct CommandRing {
    ring: TrbRing,
}

impl CommandRing {
    pub fn allocate<A: DmaAllocator + ?Sized>(dma: &A, size: usize) -> Result<Self, MemoryError> {
        Ok(Self {
            ring: TrbRing::allocate(dma, size, true)?,
        })
    }

    pub fn release<A: DmaAllocator + ?Sized>(self, dma: &A) {
        self.ring.release(dma);
    }

    /// CRCR に書く値（ベース | RCS）
    pub fn crcr_value(&self) -> u64 {
        self.ring.base() | if self.ring.cycle_state() { CRCR_RCS } else { 0 }
    }

    /// エンキューのみ（ドアベルは鳴らさない）
    pub fn enqueue(&mut self, trb: Trb) -> u64 {
        self.ring.push(trb)
    }

    /// エンキューしてコマンドドアベル (doorbell 0, target 0) を鳴らす
    ///
    /// 戻り値はコマンド TRB の物理アドレス。完了イベントの Parameter に
    /// 同じ値が返ってくる。
    pub fn post<R: RegisterIo>(&mut self, regs: &XhciRegisters<R>, trb: Trb) -> u64 {
        let address = self.enqueue(trb);
        regs.ring_doorbell(0, DoorbellTarget::Command);
        address
    }

    pub fn ring(&self) -> &TrbRing {
        &self.ring
    }
}

// ============================================================================
// Transfer Ring
// ============================================================================

/// 転送リング（エンドポイントごと）
#[derive(Debug)]
pub struct TransferRing {
    ring: TrbRing,
}

impl TransferRing {
    pub fn allocate<A: DmaAllocator + ?Sized>(dma: &A, size: usize) -> Result<Self, MemoryError> {
        Ok(Self {
            ring: TrbRing::allocate(dma, size, true)?,
        })
    }

    pub fn release<A: DmaAllocator + ?Sized>(self, dma: &A) {
        self.ring.release(dma);
    }

    pub fn enqueue(&mut self, trb: Trb) -> u64 {
        self.ring.push(trb)
    }

    /// エンドポイントコンテキストの TR Dequeue Pointer に書く値（ベース、DCS）
    pub fn dequeue_pointer(&self) -> (u64, bool) {
        (self.ring.base(), self.ring.cycle_state())
    }

    pub fn ring(&self) -> &TrbRing {
        &self.ring
    }
}

// ============================================================================
// Event Ring
// ============================================================================

/// イベントリング（コントローラ → ホスト）と1エントリの ERST
#[derive(Debug)]
pub struct EventRing {
    ring: TrbRing,
    erst: DmaBuffer,
}

impl EventRing {
    /// セグメントと ERST を確保して ERST エントリを書く
    ///
    /// ERST の確保に失敗した場合はセグメントを返却してからエラーを返す。
    pub fn allocate<A: DmaAllocator + ?Sized>(dma: &A, size: usize) -> Result<Self, MemoryError> {
        let ring = TrbRing::allocate(dma, size, false)?;
        let mut erst = match dma.allocate(core::mem::size_of::<ErstEntry>(), ERST_ALIGNMENT) {
            Ok(erst) => erst,
            Err(e) => {
                ring.release(dma);
                return Err(e);
            }
        };

        erst.write(
            0,
            ErstEntry {
                ring_segment_base: ring.base(),
                ring_segment_size: size as u32,
                reserved: 0,
            },
        );
        Ok(Self { ring, erst })
    }

    pub fn release<A: DmaAllocator + ?Sized>(self, dma: &A) {
        self.ring.release(dma);
        dma.release(self.erst);
    }

    /// ERST の物理アドレス（ERSTBA に書く）
    pub fn erst_address(&self) -> u64 {
        self.erst.phys_addr()
    }

    /// ERST エントリ数（ERSTSZ に書く）
    pub fn erst_size(&self) -> u32 {
        1
    }

    pub fn segment_base(&self) -> u64 {
        self.ring.base()
    }

    /// 次のイベントを取り出す（未生産なら None、インデックスは動かない）
    pub fn dequeue(&mut self) -> Option<Trb> {
        self.ring.pop()
    }

    /// ERDP に書く値（現在のデキュー位置 | EHB）
    pub fn erdp(&self) -> u64 {
        self.ring.trb_address(self.ring.dequeue_index()) | ERDP_EHB
    }

    pub fn ring(&self) -> &TrbRing {
        &self.ring
    }

    /// コントローラ側の書き込みを模擬する（テスト用）
    #[cfg(test)]
    pub(crate) fn produce_at(&mut self, index: usize, trb: Trb) {
        self.ring.write_trb(index, trb);
    }
}
