// ============================================================================
// src/io/usb/xhci/event_handler.rs - xHCI Event Handling
// ============================================================================
//!
//! xHCI イベントリング処理。
//!
//! ## イベントタイプ
//! - コマンド完了 (Command Completion)
//! - 転送完了 (Transfer Event)
//! - ポート状態変更 (Port Status Change)
//! - その他 (Host Controller など) はログに残して捨てる

use alloc::vec::Vec;
use hashbrown::{HashMap, HashSet};
use log::{debug, warn};

use super::trb::{CompletionCode, Trb, TrbType};
use crate::io::usb::SlotId;

// ============================================================================
// Event Types
// ============================================================================

/// コマンド完了イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandCompletion {
    /// 完了したコマンドTRBの物理アドレス
    pub command_trb: u64,
    /// 完了コード
    pub code: CompletionCode,
    /// スロットID（Enable Slot では割り当てられたスロット）
    pub slot_id: SlotId,
}

/// 転送完了イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEvent {
    /// TRBポインタ
    pub trb_pointer: u64,
    /// 完了コード
    pub code: CompletionCode,
    /// スロットID
    pub slot_id: SlotId,
    /// エンドポイントID (DCI)
    pub endpoint_id: u8,
    /// 転送されなかった残りバイト数
    pub residual: u32,
}

/// ポート状態変更イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatusChange {
    /// ポート番号 (1-based)
    pub port_id: u8,
}

/// 処理されたイベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessedEvent {
    CommandCompletion(CommandCompletion),
    Transfer(TransferEvent),
    PortStatusChange(PortStatusChange),
    HostController { code: CompletionCode },
    Unknown { trb_type: u8 },
}

/// イベントTRBを解析
pub fn parse_event(trb: &Trb) -> ProcessedEvent {
    match TrbType::from_u8(trb.trb_type()) {
        Some(TrbType::CommandCompletion) => ProcessedEvent::CommandCompletion(CommandCompletion {
            command_trb: trb.parameter & !0xF,
            code: trb.completion_code(),
            slot_id: trb.slot_id(),
        }),
        Some(TrbType::Transfer) => ProcessedEvent::Transfer(TransferEvent {
            trb_pointer: trb.parameter,
            code: trb.completion_code(),
            slot_id: trb.slot_id(),
            endpoint_id: trb.endpoint_id(),
            residual: trb.transfer_length(),
        }),
        Some(TrbType::PortStatusChange) => ProcessedEvent::PortStatusChange(PortStatusChange {
            port_id: trb.port_id(),
        }),
        Some(TrbType::HostController) => ProcessedEvent::HostController {
            code: trb.completion_code(),
        },
        _ => ProcessedEvent::Unknown {
            trb_type: trb.trb_type(),
        },
    }
}

// ============================================================================
// Event Dispatcher
// ============================================================================

/// イベントの記録先
///
/// コマンド完了と転送完了はどちらも TRB の物理アドレスで記録する。
/// 記録するのは `expect` で登録されたアドレスだけで、待ち手のいない
/// イベント（タイムアウト後に届いた完了など）はログに残して捨てる。
#[derive(Debug, Default)]
pub struct EventDispatcher {
    /// 完了を待っている TRB アドレス
    awaited: HashSet<u64>,
    /// コマンド完了（コマンドTRBアドレス → 完了）
    completions: HashMap<u64, CommandCompletion>,
    /// 転送完了（転送TRBアドレス → 完了）
    transfers: HashMap<u64, TransferEvent>,
    /// 未処理のポート変更（1-based, 重複なし）
    port_changes: Vec<u8>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// TRB アドレスの完了を待つことを登録
    pub fn expect(&mut self, trb: u64) {
        self.awaited.insert(trb);
    }

    /// 待ちを取り消し、記録済みの完了も捨てる
    pub fn forget(&mut self, trb: u64) {
        self.awaited.remove(&trb);
        self.completions.remove(&trb);
        self.transfers.remove(&trb);
    }

    /// イベントを記録
    pub fn dispatch(&mut self, event: ProcessedEvent) {
        match event {
            ProcessedEvent::CommandCompletion(completion) => {
                debug!(
                    "xHCI: command completion for TRB {:#x}: {:?} (slot {})",
                    completion.command_trb, completion.code, completion.slot_id
                );
                if self.awaited.contains(&completion.command_trb) {
                    self.completions.insert(completion.command_trb, completion);
                } else {
                    warn!(
                        "xHCI: dropping completion for unawaited command TRB {:#x}",
                        completion.command_trb
                    );
                }
            }
            ProcessedEvent::Transfer(transfer) => {
                debug!(
                    "xHCI: transfer event slot {} ep {} TRB {:#x}: {:?}, residual {}",
                    transfer.slot_id,
                    transfer.endpoint_id,
                    transfer.trb_pointer,
                    transfer.code,
                    transfer.residual
                );
                if self.awaited.contains(&transfer.trb_pointer) {
                    self.transfers.insert(transfer.trb_pointer, transfer);
                } else {
                    warn!(
                        "xHCI: dropping transfer event for unawaited TRB {:#x} (slot {})",
                        transfer.trb_pointer, transfer.slot_id
                    );
                }
            }
            ProcessedEvent::PortStatusChange(change) => {
                debug!("xHCI: port status change on port {}", change.port_id);
                if !self.port_changes.contains(&change.port_id) {
                    self.port_changes.push(change.port_id);
                }
            }
            ProcessedEvent::HostController { code } => {
                warn!("xHCI: host controller event: {:?}", code);
            }
            ProcessedEvent::Unknown { trb_type } => {
                warn!("xHCI: unhandled event TRB type {}", trb_type);
            }
        }
    }

    /// コマンド完了を取り出す
    pub fn take_completion(&mut self, command_trb: u64) -> Option<CommandCompletion> {
        let completion = self.completions.remove(&command_trb)?;
        self.awaited.remove(&command_trb);
        Some(completion)
    }

    /// 転送TRBの完了を取り出す
    pub fn take_transfer(&mut self, trb_pointer: u64) -> Option<TransferEvent> {
        let transfer = self.transfers.remove(&trb_pointer)?;
        self.awaited.remove(&trb_pointer);
        Some(transfer)
    }

    /// 記録済みのポート変更を取り出す
    pub fn take_port_changes(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.port_changes)
    }

    pub fn pending_completions(&self) -> usize {
        self.completions.len()
    }

    /// 完了待ちの TRB 数
    pub fn awaited(&self) -> usize {
        self.awaited.len()
    }
}
