// ============================================================================
// src/io/usb/mod.rs - USB Subsystem
// ============================================================================
//!
//! # USBサブシステム
//!
//! xHCI (USB 3.x) コントローラを中心としたホスト側の実装。
//!
//! ## アーキテクチャ
//! - xHCI ホストコントローラドライバ（ポーリング駆動）
//! - USB デバイスの列挙（スロット割り当て、アドレス割り当て、ディスクリプタ取得）
//!
//! ## 型安全性
//! - Newtype パターンによるスロット/ポート/アドレス管理

pub mod descriptor;
pub mod xhci;

use core::fmt;

use crate::error::MemoryError;
use xhci::trb::{CompletionCode, TrbType};
use xhci::wait::WaitStage;

// ============================================================================
// USB Constants
// ============================================================================

/// USB 速度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    /// Full Speed (12 Mbps)
    Full,
    /// Low Speed (1.5 Mbps)
    Low,
    /// High Speed (480 Mbps)
    High,
    /// Super Speed (5 Gbps)
    Super,
}

impl UsbSpeed {
    /// PORTSC の Port Speed フィールド値から変換
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(UsbSpeed::Full),
            2 => Some(UsbSpeed::Low),
            3 => Some(UsbSpeed::High),
            4 => Some(UsbSpeed::Super),
            _ => None,
        }
    }

    /// xHCI スロットコンテキスト用の速度値
    pub fn to_slot_speed(&self) -> u8 {
        match self {
            UsbSpeed::Full => 1,
            UsbSpeed::Low => 2,
            UsbSpeed::High => 3,
            UsbSpeed::Super => 4,
        }
    }

    /// 最大パケットサイズ（コントロールエンドポイント）
    pub fn default_max_packet_size(&self) -> u16 {
        match self {
            UsbSpeed::Low => 8,
            UsbSpeed::Full | UsbSpeed::High => 64,
            UsbSpeed::Super => 512,
        }
    }

    /// 転送速度 (kbps)
    pub fn kbps(&self) -> u32 {
        match self {
            UsbSpeed::Low => 1_500,
            UsbSpeed::Full => 12_000,
            UsbSpeed::High => 480_000,
            UsbSpeed::Super => 5_000_000,
        }
    }
}

impl fmt::Display for UsbSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UsbSpeed::Full => "Full Speed (12 Mbps)",
            UsbSpeed::Low => "Low Speed (1.5 Mbps)",
            UsbSpeed::High => "High Speed (480 Mbps)",
            UsbSpeed::Super => "Super Speed (5 Gbps)",
        })
    }
}

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// USBデバイスアドレス (型安全)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceAddress(pub u8);

impl DeviceAddress {
    pub const UNASSIGNED: Self = Self(0);

    pub fn is_valid(&self) -> bool {
        self.0 > 0 && self.0 <= 127
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// xHCIスロットID (型安全、1始まり)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SlotId(pub u8);

impl SlotId {
    pub const INVALID: Self = Self(0);

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ルートハブポート番号 (0始まりのインデックス)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PortNumber(pub u8);

impl PortNumber {
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// 1始まりのポート番号（スロットコンテキスト、イベント、ログ用）
    pub fn one_indexed(&self) -> u8 {
        self.0 + 1
    }
}

// ============================================================================
// USB Transfer Types
// ============================================================================

/// USB転送のステータス
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// 成功
    Success,
    /// ショートパケット（エラーではない）
    ShortPacket,
    /// STALLエラー
    Stalled,
    /// バッファエラー
    BufferError,
    /// バブルエラー
    BabbleError,
    /// USBトランザクションエラー
    TransactionError,
    /// TRBエラー
    TrbError,
    /// その他のエラー（完了コード）
    Error(u8),
}

impl TransferStatus {
    /// 転送が完了したとみなせるか
    pub fn is_complete(&self) -> bool {
        matches!(self, TransferStatus::Success | TransferStatus::ShortPacket)
    }
}

// ============================================================================
// USB Setup Packet
// ============================================================================

/// 標準リクエストコード
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
}

/// bmRequestType の方向ビット (Device-to-host)
pub const REQUEST_TYPE_DEVICE_TO_HOST: u8 = 0x80;

/// USBセットアップパケット (8バイト)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    /// リクエストタイプ
    pub bm_request_type: u8,
    /// リクエスト
    pub b_request: u8,
    /// 値
    pub w_value: u16,
    /// インデックス
    pub w_index: u16,
    /// 長さ
    pub w_length: u16,
}

impl SetupPacket {
    /// GET_DESCRIPTOR リクエスト
    pub fn get_descriptor(desc_type: u8, desc_index: u8, length: u16) -> Self {
        Self {
            bm_request_type: REQUEST_TYPE_DEVICE_TO_HOST, // Standard, Device
            b_request: request::GET_DESCRIPTOR,
            w_value: ((desc_type as u16) << 8) | (desc_index as u16),
            w_index: 0,
            w_length: length,
        }
    }

    /// SET_CONFIGURATION リクエスト
    pub fn set_configuration(config: u8) -> Self {
        Self {
            bm_request_type: 0x00,
            b_request: request::SET_CONFIGURATION,
            w_value: config as u16,
            w_index: 0,
            w_length: 0,
        }
    }

    /// GET_STATUS リクエスト
    pub fn get_status() -> Self {
        Self {
            bm_request_type: REQUEST_TYPE_DEVICE_TO_HOST,
            b_request: request::GET_STATUS,
            w_value: 0,
            w_index: 0,
            w_length: 2,
        }
    }

    /// データステージが Device-to-host か
    pub fn is_device_to_host(&self) -> bool {
        self.bm_request_type & REQUEST_TYPE_DEVICE_TO_HOST != 0
    }

    /// Setup Stage TRB の Parameter フィールド（即値データ）
    pub fn to_trb_parameter(&self) -> u64 {
        (self.bm_request_type as u64)
            | ((self.b_request as u64) << 8)
            | ((self.w_value as u64) << 16)
            | ((self.w_index as u64) << 32)
            | ((self.w_length as u64) << 48)
    }
}

// ============================================================================
// USB Error Types
// ============================================================================

/// USBエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// PCI上にコントローラがない
    ControllerNotFound,
    /// コントローラが Running ではない
    NotRunning,
    /// ポーリング予算切れ（最後に観測したレジスタ値つき）
    Timeout { stage: WaitStage, last: u32 },
    /// DMAメモリ不足
    NoResources(MemoryError),
    /// コマンドが成功以外で完了
    CommandFailed { command: TrbType, code: CompletionCode },
    /// 転送エラー
    TransferError(TransferStatus),
    /// STALLエラー
    Stalled,
    /// デバイスが見つからない（スロット未使用）
    DeviceNotFound,
    /// 無効なパラメータ
    InvalidParameter,
    /// バッファサイズエラー
    BufferSize,
    /// ディスクリプタの形式不正
    InvalidDescriptor,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbError::ControllerNotFound => write!(f, "no xHCI controller found"),
            UsbError::NotRunning => write!(f, "controller not running"),
            UsbError::Timeout { stage, last } => {
                write!(f, "timeout waiting for {} (last value {:#010x})", stage, last)
            }
            UsbError::NoResources(e) => write!(f, "out of DMA memory: {}", e),
            UsbError::CommandFailed { command, code } => {
                write!(f, "{:?} command failed: {:?}", command, code)
            }
            UsbError::TransferError(status) => write!(f, "transfer error: {:?}", status),
            UsbError::Stalled => write!(f, "endpoint stalled"),
            UsbError::DeviceNotFound => write!(f, "device not found"),
            UsbError::InvalidParameter => write!(f, "invalid parameter"),
            UsbError::BufferSize => write!(f, "buffer size error"),
            UsbError::InvalidDescriptor => write!(f, "malformed descriptor"),
        }
    }
}

impl From<MemoryError> for UsbError {
    fn from(e: MemoryError) -> Self {
        UsbError::NoResources(e)
    }
}

pub type UsbResult<T> = Result<T, UsbError>;

// ============================================================================
// Kernel entry
// ============================================================================

/// 本番構成でUSBサブシステムを初期化
///
/// CF8/CFC で xHCI を探し、見つかればリセット・起動・接続ポートの列挙まで行う。
/// コントローラが無いのはエラーではなく `Ok(None)` を返す。
#[cfg(target_arch = "x86_64")]
pub fn init() -> crate::error::KernelResult<
    Option<xhci::XhciController<xhci::VolatileMmio, crate::io::dma::KernelHeapDma, xhci::SpinWait>>,
> {
    use crate::io::dma::KernelHeapDma;
    use crate::io::pci::LegacyPciAccessor;

    log::info!("=== USB 3.0 (xHCI) Driver Initialization ===");

    // SAFETY: カーネルはMMIO領域をアイデンティティマッピングしている
    let mmio = unsafe { xhci::VolatileMmio::new() };
    let config = xhci::XhciConfig::default();
    match xhci::discover_and_start_with_config(
        &LegacyPciAccessor::new(),
        mmio,
        KernelHeapDma::new(),
        xhci::SpinWait::from_config(&config),
        config,
    ) {
        Ok(mut controller) => {
            let devices = controller.enumerate_connected_ports();
            log::info!("USB 3.0 driver initialized ({} device(s) enumerated)", devices.len());
            Ok(Some(controller))
        }
        Err(UsbError::ControllerNotFound) => {
            log::info!("No xHCI controllers found");
            Ok(None)
        }
        Err(e) => {
            log::error!("USB 3.0 driver initialization failed: {}", e);
            Err(e.into())
        }
    }
}
