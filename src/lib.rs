// ============================================================================
// src/lib.rs - xHCI Kernel Driver Library
// ============================================================================
//!
//! フリースタンディングカーネル向け USB 3.x (xHCI) ホストコントローラドライバ。
//!
//! ## 構成
//! - `io::pci`: コントローラの発見 (Class 0x0C / 0x03 / 0x30)
//! - `io::usb::xhci`: レジスタ層、コマンド/イベントリング、ライフサイクル、
//!   ポート管理、デバイス列挙、コントロール転送
//! - `io::dma`: 物理メモリ割り当てケーパビリティ
//! - `io::log`: `log` クレートのバックエンド
//!
//! すべての待機はポーリングで、[`io::usb::xhci::WaitPolicy`] が回数を制限する。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod io;

pub use error::{KernelError, KernelResult};
pub use io::usb::xhci::{XhciController, discover_and_start};
