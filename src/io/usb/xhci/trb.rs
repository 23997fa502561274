// ============================================================================
// src/io/usb/xhci/trb.rs - TRB (Transfer Request Block) Definitions
// ============================================================================
//!
//! TRB (Transfer Request Block) 関連の型定義と操作。
//!
//! ## 概要
//! xHCIはTRBベースのコマンド/転送メカニズムを使用。
//! - Command TRB: ホストからコントローラへのコマンド
//! - Transfer TRB: データ転送要求
//! - Event TRB: コントローラからホストへの通知
//!
//! ビルダーはサイクルビット 0 の TRB を作る。サイクルビットは
//! リングへのエンキュー時にリング側が設定する。

use crate::io::usb::{SetupPacket, SlotId, TransferStatus};

// ============================================================================
// TRB Types
// ============================================================================

/// TRBタイプ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrbType {
    Normal = 1,
    SetupStage = 2,
    DataStage = 3,
    StatusStage = 4,
    Isoch = 5,
    Link = 6,
    EventData = 7,
    NoOp = 8,
    EnableSlot = 9,
    DisableSlot = 10,
    AddressDevice = 11,
    ConfigureEndpoint = 12,
    EvaluateContext = 13,
    ResetEndpoint = 14,
    StopEndpoint = 15,
    SetTrDequeuePointer = 16,
    ResetDevice = 17,
    NoOpCommand = 23,
    // Event TRBs
    Transfer = 32,
    CommandCompletion = 33,
    PortStatusChange = 34,
    HostController = 37,
}

impl TrbType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(TrbType::Normal),
            2 => Some(TrbType::SetupStage),
            3 => Some(TrbType::DataStage),
            4 => Some(TrbType::StatusStage),
            5 => Some(TrbType::Isoch),
            6 => Some(TrbType::Link),
            7 => Some(TrbType::EventData),
            8 => Some(TrbType::NoOp),
            9 => Some(TrbType::EnableSlot),
            10 => Some(TrbType::DisableSlot),
            11 => Some(TrbType::AddressDevice),
            12 => Some(TrbType::ConfigureEndpoint),
            13 => Some(TrbType::EvaluateContext),
            14 => Some(TrbType::ResetEndpoint),
            15 => Some(TrbType::StopEndpoint),
            16 => Some(TrbType::SetTrDequeuePointer),
            17 => Some(TrbType::ResetDevice),
            23 => Some(TrbType::NoOpCommand),
            32 => Some(TrbType::Transfer),
            33 => Some(TrbType::CommandCompletion),
            34 => Some(TrbType::PortStatusChange),
            37 => Some(TrbType::HostController),
            _ => None,
        }
    }
}

// ============================================================================
// Completion Code
// ============================================================================

/// TRB完了コード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionCode {
    Invalid = 0,
    Success = 1,
    DataBufferError = 2,
    BabbleDetected = 3,
    UsbTransactionError = 4,
    TrbError = 5,
    StallError = 6,
    ResourceError = 7,
    BandwidthError = 8,
    NoSlotsAvailable = 9,
    InvalidStreamType = 10,
    SlotNotEnabled = 11,
    EndpointNotEnabled = 12,
    ShortPacket = 13,
    RingUnderrun = 14,
    RingOverrun = 15,
    ParameterError = 17,
    ContextStateError = 19,
    EventRingFull = 21,
    IncompatibleDevice = 22,
    CommandRingStopped = 24,
    CommandAborted = 25,
    Stopped = 26,
    Undefined = 33,
}

impl CompletionCode {
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => CompletionCode::Invalid,
            1 => CompletionCode::Success,
            2 => CompletionCode::DataBufferError,
            3 => CompletionCode::BabbleDetected,
            4 => CompletionCode::UsbTransactionError,
            5 => CompletionCode::TrbError,
            6 => CompletionCode::StallError,
            7 => CompletionCode::ResourceError,
            8 => CompletionCode::BandwidthError,
            9 => CompletionCode::NoSlotsAvailable,
            10 => CompletionCode::InvalidStreamType,
            11 => CompletionCode::SlotNotEnabled,
            12 => CompletionCode::EndpointNotEnabled,
            13 => CompletionCode::ShortPacket,
            14 => CompletionCode::RingUnderrun,
            15 => CompletionCode::RingOverrun,
            17 => CompletionCode::ParameterError,
            19 => CompletionCode::ContextStateError,
            21 => CompletionCode::EventRingFull,
            22 => CompletionCode::IncompatibleDevice,
            24 => CompletionCode::CommandRingStopped,
            25 => CompletionCode::CommandAborted,
            26 => CompletionCode::Stopped,
            _ => CompletionCode::Undefined,
        }
    }

    /// 成功扱いか（ShortPacket はエラーではない）
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionCode::Success | CompletionCode::ShortPacket)
    }

    pub fn to_transfer_status(&self) -> TransferStatus {
        match self {
            CompletionCode::Success => TransferStatus::Success,
            CompletionCode::ShortPacket => TransferStatus::ShortPacket,
            CompletionCode::StallError => TransferStatus::Stalled,
            CompletionCode::DataBufferError => TransferStatus::BufferError,
            CompletionCode::BabbleDetected => TransferStatus::BabbleError,
            CompletionCode::UsbTransactionError => TransferStatus::TransactionError,
            CompletionCode::TrbError => TransferStatus::TrbError,
            _ => TransferStatus::Error(*self as u8),
        }
    }
}

// ============================================================================
// Control Field Bits
// ============================================================================

/// Cycle bit
pub const TRB_CYCLE: u32 = 1 << 0;
/// Link TRB: Toggle Cycle
pub const TRB_TOGGLE_CYCLE: u32 = 1 << 1;
/// Interrupt on Short Packet
pub const TRB_ISP: u32 = 1 << 2;
/// Interrupt On Completion
pub const TRB_IOC: u32 = 1 << 5;
/// Immediate Data
pub const TRB_IDT: u32 = 1 << 6;
/// Address Device: Block Set Address Request
pub const TRB_BSR: u32 = 1 << 9;
/// Data/Status Stage: Direction IN
pub const TRB_DIR_IN: u32 = 1 << 16;

const TRB_TYPE_SHIFT: u32 = 10;
const TRB_TYPE_MASK: u32 = 0x3F;

/// Setup Stage TRB の Transfer Type (TRT) フィールド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferKind {
    NoData = 0,
    Out = 2,
    In = 3,
}

impl TransferKind {
    pub fn from_setup(setup: &SetupPacket) -> Self {
        if setup.w_length == 0 {
            TransferKind::NoData
        } else if setup.is_device_to_host() {
            TransferKind::In
        } else {
            TransferKind::Out
        }
    }
}

// ============================================================================
// TRB Structure
// ============================================================================

/// Transfer Request Block (16バイト)
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Trb {
    /// Parameter (depends on TRB type)
    pub parameter: u64,
    /// Status
    pub status: u32,
    /// Control
    pub control: u32,
}

impl Trb {
    fn with_type(trb_type: TrbType) -> Self {
        Self {
            parameter: 0,
            status: 0,
            control: (trb_type as u32) << TRB_TYPE_SHIFT,
        }
    }

    /// TRBタイプを取得
    pub fn trb_type(&self) -> u8 {
        ((self.control >> TRB_TYPE_SHIFT) & TRB_TYPE_MASK) as u8
    }

    /// サイクルビットを取得
    pub fn cycle_bit(&self) -> bool {
        (self.control & TRB_CYCLE) != 0
    }

    /// サイクルビットを設定
    pub fn set_cycle_bit(&mut self, cycle: bool) {
        if cycle {
            self.control |= TRB_CYCLE;
        } else {
            self.control &= !TRB_CYCLE;
        }
    }

    // ---- Event accessors ----

    /// 完了コード (status bits 31:24)
    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode::from_u8((self.status >> 24) as u8)
    }

    /// スロットID (control bits 31:24)
    pub fn slot_id(&self) -> SlotId {
        SlotId((self.control >> 24) as u8)
    }

    /// エンドポイントID / DCI (control bits 20:16)
    pub fn endpoint_id(&self) -> u8 {
        ((self.control >> 16) & 0x1F) as u8
    }

    /// Transfer Event の残りバイト数 (status bits 23:0)
    pub fn transfer_length(&self) -> u32 {
        self.status & 0x00FF_FFFF
    }

    /// Port Status Change Event のポートID (1始まり, parameter bits 31:24)
    pub fn port_id(&self) -> u8 {
        ((self.parameter >> 24) & 0xFF) as u8
    }

    // ---- Transfer TRBs ----

    /// Normal TRB を作成
    pub fn normal(data_ptr: u64, length: u32) -> Self {
        let mut trb = Self::with_type(TrbType::Normal);
        trb.parameter = data_ptr;
        trb.status = length & 0x1FFFF;
        trb.control |= TRB_IOC;
        trb
    }

    /// Setup Stage TRB を作成（8バイトのセットアップパケットを即値で格納）
    pub fn setup_stage(setup: &SetupPacket) -> Self {
        let mut trb = Self::with_type(TrbType::SetupStage);
        trb.parameter = setup.to_trb_parameter();
        trb.status = 8;
        trb.control |= TRB_IDT | ((TransferKind::from_setup(setup) as u32) << 16);
        trb
    }

    /// Data Stage TRB を作成
    ///
    /// ISP を立てるので、短い IN 転送はこの TRB を指す Short Packet
    /// イベントで残りバイト数を報告する。
    pub fn data_stage(data_ptr: u64, length: u32, dir_in: bool) -> Self {
        let mut trb = Self::with_type(TrbType::DataStage);
        trb.parameter = data_ptr;
        trb.status = length & 0x1FFFF;
        trb.control |= TRB_ISP;
        if dir_in {
            trb.control |= TRB_DIR_IN;
        }
        trb
    }

    /// Status Stage TRB を作成（完了時に割り込み = 転送イベント）
    pub fn status_stage(dir_in: bool) -> Self {
        let mut trb = Self::with_type(TrbType::StatusStage);
        trb.control |= TRB_IOC;
        if dir_in {
            trb.control |= TRB_DIR_IN;
        }
        trb
    }

    /// Link TRB を作成
    pub fn link(next_segment: u64, toggle_cycle: bool) -> Self {
        let mut trb = Self::with_type(TrbType::Link);
        trb.parameter = next_segment;
        if toggle_cycle {
            trb.control |= TRB_TOGGLE_CYCLE;
        }
        trb
    }

    // ---- Command TRBs ----

    /// NoOp コマンドTRB を作成
    pub fn noop_command() -> Self {
        Self::with_type(TrbType::NoOpCommand)
    }

    /// Enable Slot コマンドTRB を作成
    pub fn enable_slot() -> Self {
        Self::with_type(TrbType::EnableSlot)
    }

    /// Disable Slot コマンドTRB を作成
    pub fn disable_slot(slot_id: SlotId) -> Self {
        let mut trb = Self::with_type(TrbType::DisableSlot);
        trb.control |= (slot_id.as_u8() as u32) << 24;
        trb
    }

    /// Address Device コマンドTRB を作成
    pub fn address_device(input_context_ptr: u64, slot_id: SlotId, bsr: bool) -> Self {
        let mut trb = Self::with_type(TrbType::AddressDevice);
        trb.parameter = input_context_ptr;
        trb.control |= (slot_id.as_u8() as u32) << 24;
        if bsr {
            trb.control |= TRB_BSR;
        }
        trb
    }

    /// Configure Endpoint コマンドTRB を作成
    pub fn configure_endpoint(input_context_ptr: u64, slot_id: SlotId) -> Self {
        let mut trb = Self::with_type(TrbType::ConfigureEndpoint);
        trb.parameter = input_context_ptr;
        trb.control |= (slot_id.as_u8() as u32) << 24;
        trb
    }

    /// Evaluate Context コマンドTRB を作成
    pub fn evaluate_context(input_context_ptr: u64, slot_id: SlotId) -> Self {
        let mut trb = Self::with_type(TrbType::EvaluateContext);
        trb.parameter = input_context_ptr;
        trb.control |= (slot_id.as_u8() as u32) << 24;
        trb
    }

    /// Reset Endpoint コマンドTRB を作成
    pub fn reset_endpoint(slot_id: SlotId, dci: u8) -> Self {
        let mut trb = Self::with_type(TrbType::ResetEndpoint);
        trb.control |= ((slot_id.as_u8() as u32) << 24) | ((dci as u32 & 0x1F) << 16);
        trb
    }

    /// Set TR Dequeue Pointer コマンドTRB を作成
    pub fn set_tr_dequeue_pointer(slot_id: SlotId, dci: u8, dequeue_ptr: u64, dcs: bool) -> Self {
        let mut trb = Self::with_type(TrbType::SetTrDequeuePointer);
        trb.parameter = (dequeue_ptr & !0xF) | dcs as u64;
        trb.control |= ((slot_id.as_u8() as u32) << 24) | ((dci as u32 & 0x1F) << 16);
        trb
    }

    /// Reset Device コマンドTRB を作成
    pub fn reset_device(slot_id: SlotId) -> Self {
        let mut trb = Self::with_type(TrbType::ResetDevice);
        trb.control |= (slot_id.as_u8() as u32) << 24;
        trb
    }
}

// ============================================================================
// Event Ring Segment Table Entry
// ============================================================================

/// イベントリングセグメントテーブルエントリ (16バイト)
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ErstEntry {
    /// リングセグメントベースアドレス
    pub ring_segment_base: u64,
    /// リングセグメントサイズ（TRB数、下位16ビットのみ有効）
    pub ring_segment_size: u32,
    /// 予約
    pub reserved: u32,
}
