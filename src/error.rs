//! 統一エラーハンドリングモジュール
//!
//! ドライバ全体で使用される統一エラー型を定義し、
//! 各サブシステムのエラーから変換を提供します。

use core::fmt;

use crate::io::usb::UsbError;

/// カーネル側から見た統一エラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// メモリ関連エラー
    Memory(MemoryError),
    /// I/O関連エラー
    Io(IoError),
    /// USB関連エラー
    Usb(UsbError),
}

/// メモリ関連エラーの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// アライメント不正
    InvalidAlignment,
    /// サイズ不正
    InvalidSize,
    /// DMA固有: バッファアロケーション失敗
    DmaAllocationFailed,
}

/// I/O関連エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// デバイスが見つからない
    DeviceNotFound,
    /// ポーリング予算切れ
    Timeout,
}

// ===== Display implementations =====

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Memory(e) => write!(f, "Memory error: {}", e),
            KernelError::Io(e) => write!(f, "I/O error: {}", e),
            KernelError::Usb(e) => write!(f, "USB error: {}", e),
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::InvalidAlignment => write!(f, "invalid alignment"),
            MemoryError::InvalidSize => write!(f, "invalid size"),
            MemoryError::DmaAllocationFailed => write!(f, "DMA allocation failed"),
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::DeviceNotFound => write!(f, "device not found"),
            IoError::Timeout => write!(f, "timeout"),
        }
    }
}

// ===== From implementations for sub-errors =====

impl From<MemoryError> for KernelError {
    fn from(e: MemoryError) -> Self {
        KernelError::Memory(e)
    }
}

impl From<IoError> for KernelError {
    fn from(e: IoError) -> Self {
        KernelError::Io(e)
    }
}

impl From<UsbError> for KernelError {
    fn from(e: UsbError) -> Self {
        match e {
            UsbError::NoResources(mem) => KernelError::Memory(mem),
            UsbError::ControllerNotFound => KernelError::Io(IoError::DeviceNotFound),
            UsbError::Timeout { .. } => KernelError::Io(IoError::Timeout),
            other => KernelError::Usb(other),
        }
    }
}

/// カーネル結果型
pub type KernelResult<T> = Result<T, KernelError>;
