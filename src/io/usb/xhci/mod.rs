// ============================================================================
// src/io/usb/xhci/mod.rs - xHCI Host Controller Driver Module
// ============================================================================
//!
//! # xHCI (eXtensible Host Controller Interface) ドライバ
//!
//! USB 3.x ホストコントローラドライバ（ポーリング駆動）。
//!
//! ## アーキテクチャ
//! - レジスタ操作は [`RegisterIo`] 経由
//! - TRB (Transfer Request Block) ベースのコマンド/転送
//! - イベントリングのポーリングによる完了通知
//! - 待機はすべて [`WaitPolicy`] の予算内で打ち切る
//!
//! ## メモリ構造
//! - DCBAA (Device Context Base Address Array)
//! - Transfer Ring per endpoint (EP0)
//! - Command Ring
//! - Event Ring + ERST
//!
//! ## モジュール構造
//! - `registers`: レジスタブロックへの型付きアクセス
//! - `trb`: TRB 定義と操作
//! - `ring_manager`: コマンド/転送/イベントリング
//! - `context`: デバイスコンテキスト構造体と DCBAA
//! - `event_handler`: イベントの解析と記録
//! - `initialization`: ケーパビリティ、リセット、起動
//! - `controller`: xHCI コントローラと PCI 検出
//! - `command`: コマンド発行と完了待ち
//! - `port_manager`: ルートハブポート
//! - `device`: スロット表とデバイス列挙
//! - `transfer`: コントロール転送
//! - `wait`: ポーリング方針

pub mod command;
pub mod context;
pub mod controller;
pub mod device;
pub mod event_handler;
pub mod initialization;
pub mod port_manager;
pub mod registers;
pub mod ring_manager;
pub mod transfer;
pub mod trb;
pub mod wait;

// Re-exports
pub use context::{ContextLayout, Dcbaa, DeviceContext, EndpointContext, InputContext, SlotContext};
pub use controller::{XhciController, discover_and_start, discover_and_start_with_config, find_xhci};
pub use device::{DeviceTable, EnumeratedDevice, MAX_DEVICE_SLOTS, UsbDeviceSlot};
pub use event_handler::{CommandCompletion, EventDispatcher, ProcessedEvent, TransferEvent};
pub use initialization::{ControllerMemory, ControllerState, XhciCapabilities};
pub use port_manager::PortInfo;
pub use registers::{DoorbellTarget, RegisterIo, VolatileMmio, XhciRegisters};
pub use ring_manager::{CommandRing, EventRing, TransferRing, TrbRing};
pub use trb::{CompletionCode, ErstEntry, Trb, TrbType};
pub use wait::{SpinWait, WaitPolicy, WaitStage};

// ============================================================================
// Configuration
// ============================================================================

/// ドライバ設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XhciConfig {
    /// コマンド/イベント/転送リングの TRB 数
    pub ring_size: usize,
    /// ポーリングの最大チェック回数
    pub poll_budget: u32,
    /// 1回の待機のビジーウェイト回数
    pub spins_per_delay: u32,
    /// コンフィグレーションディスクリプタの読み取り上限
    pub max_config_descriptor_len: usize,
}

impl Default for XhciConfig {
    fn default() -> Self {
        Self {
            ring_size: ring_manager::COMMAND_RING_SIZE,
            poll_budget: wait::DEFAULT_POLL_BUDGET,
            spins_per_delay: wait::DEFAULT_SPINS_PER_DELAY,
            max_config_descriptor_len: 256,
        }
    }
}
