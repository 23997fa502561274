// ============================================================================
// src/io/pci/mod.rs - PCI Common Module
// ============================================================================
//!
//! # PCI 共通モジュール
//!
//! ## モジュール構成
//! - `traits`: PciConfigRead トレイト
//! - `types`: BDF、クラスコード、レジスタオフセット
//! - `legacy`: 従来のI/Oポートベースのアクセス (x86_64)
//! - `bus`: PCIバス列挙

pub mod bus;
#[cfg(target_arch = "x86_64")]
pub mod legacy;
pub mod traits;
pub mod types;

pub use bus::{PciFunction, find_by_class, read_bar0};
#[cfg(target_arch = "x86_64")]
pub use legacy::LegacyPciAccessor;
pub use traits::PciConfigRead;
pub use types::{BdfAddress, ClassCode, config_regs};
