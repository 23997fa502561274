// ============================================================================
// src/io/usb/xhci/port_manager.rs - xHCI Port Management
// ============================================================================
//!
//! # xHCI ポート管理
//!
//! ルートハブポートの状態読み取り、リセット、速度判定を担当。
//! ポート番号は 0 始まり（PORTSC = op + 0x400 + p * 0x10）、
//! ログとスロットコンテキストでは 1 始まりで表す。

use alloc::vec::Vec;
use log::{debug, info, warn};

use super::controller::XhciController;
use super::registers::RegisterIo;
use super::wait::{WaitPolicy, WaitStage, poll_register};
use crate::io::dma::DmaAllocator;
use crate::io::usb::{PortNumber, UsbSpeed};

// ============================================================================
// PORTSC Bits
// ============================================================================

/// Current Connect Status
pub const PORTSC_CCS: u32 = 1 << 0;
/// Port Enabled/Disabled (RW1C: 1 を書くとポートが無効になる)
pub const PORTSC_PED: u32 = 1 << 1;
/// Over-current Active
pub const PORTSC_OCA: u32 = 1 << 3;
/// Port Reset
pub const PORTSC_PR: u32 = 1 << 4;
/// Port Link State (bits 5-8)
pub const PORTSC_PLS_MASK: u32 = 0xF << 5;
pub const PORTSC_PLS_SHIFT: u32 = 5;
/// Port Power
pub const PORTSC_PP: u32 = 1 << 9;
/// Port Speed (bits 10-13)
pub const PORTSC_SPEED_MASK: u32 = 0xF << 10;
pub const PORTSC_SPEED_SHIFT: u32 = 10;
/// Port Indicator Control (bits 14-15)
pub const PORTSC_PIC_MASK: u32 = 0x3 << 14;
/// Connect Status Change
pub const PORTSC_CSC: u32 = 1 << 17;
/// Port Enabled/Disabled Change
pub const PORTSC_PEC: u32 = 1 << 18;
/// Warm Port Reset Change (USB3 only)
pub const PORTSC_WRC: u32 = 1 << 19;
/// Over-current Change
pub const PORTSC_OCC: u32 = 1 << 20;
/// Port Reset Change
pub const PORTSC_PRC: u32 = 1 << 21;
/// Port Link State Change
pub const PORTSC_PLC: u32 = 1 << 22;
/// Port Config Error Change
pub const PORTSC_CEC: u32 = 1 << 23;

/// Write-1-to-clear ビット
pub const PORTSC_W1C_BITS: u32 =
    PORTSC_CSC | PORTSC_PEC | PORTSC_WRC | PORTSC_OCC | PORTSC_PRC | PORTSC_PLC | PORTSC_CEC;

/// 保持すべきビット（読み取り後の書き戻し時）
pub const PORTSC_PRESERVE_BITS: u32 = PORTSC_PP | PORTSC_PIC_MASK;

// ============================================================================
// Port Info
// ============================================================================

/// ポート状態のスナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortInfo {
    /// ポート番号 (0-based)
    pub port: PortNumber,
    /// 生の PORTSC 値
    pub portsc: u32,
    pub connected: bool,
    pub enabled: bool,
    pub over_current: bool,
    pub in_reset: bool,
    pub powered: bool,
    pub connect_changed: bool,
    pub enable_changed: bool,
    pub reset_changed: bool,
    /// ポート速度（未接続・未知のコードは None）
    pub speed: Option<UsbSpeed>,
    /// Port Link State
    pub link_state: u8,
}

impl PortInfo {
    pub fn from_portsc(port: PortNumber, portsc: u32) -> Self {
        Self {
            port,
            portsc,
            connected: portsc & PORTSC_CCS != 0,
            enabled: portsc & PORTSC_PED != 0,
            over_current: portsc & PORTSC_OCA != 0,
            in_reset: portsc & PORTSC_PR != 0,
            powered: portsc & PORTSC_PP != 0,
            connect_changed: portsc & PORTSC_CSC != 0,
            enable_changed: portsc & PORTSC_PEC != 0,
            reset_changed: portsc & PORTSC_PRC != 0,
            speed: speed_from_portsc(portsc),
            link_state: ((portsc & PORTSC_PLS_MASK) >> PORTSC_PLS_SHIFT) as u8,
        }
    }

    /// 生の速度コード (bits 13:10)
    pub fn speed_code(&self) -> u8 {
        ((self.portsc & PORTSC_SPEED_MASK) >> PORTSC_SPEED_SHIFT) as u8
    }
}

/// PORTSC の速度フィールドをデコード
pub fn speed_from_portsc(portsc: u32) -> Option<UsbSpeed> {
    UsbSpeed::from_code(((portsc & PORTSC_SPEED_MASK) >> PORTSC_SPEED_SHIFT) as u8)
}

fn log_port(port: &PortInfo) {
    let number = port.port.one_indexed();
    if !port.connected {
        debug!("Port {}: No device", number);
        return;
    }
    let enabled = if port.enabled { "Enabled" } else { "Disabled" };
    match port.speed {
        Some(speed) => info!("Port {}: Device connected - {} - {}", number, enabled, speed),
        None => info!(
            "Port {}: Device connected - {} - Unknown speed ({})",
            number,
            enabled,
            port.speed_code()
        ),
    }
    if port.over_current {
        warn!("Port {}: over-current", number);
    }
    if port.in_reset {
        debug!("Port {}: reset in progress", number);
    }
    if port.connect_changed {
        debug!("Port {}: connect status changed", number);
    }
    if port.enable_changed {
        debug!("Port {}: port enabled changed", number);
    }
}

// ============================================================================
// Port Operations
// ============================================================================

impl<R: RegisterIo, A: DmaAllocator, W: WaitPolicy> XhciController<R, A, W> {
    /// ポート数
    pub fn port_count(&self) -> u8 {
        self.capabilities().max_ports
    }

    /// 1ポートの状態を読む
    pub fn port_info(&self, port: PortNumber) -> Option<PortInfo> {
        if port.as_u8() >= self.port_count() {
            return None;
        }
        Some(PortInfo::from_portsc(port, self.regs.read_portsc(port.as_u8())))
    }

    /// 全ポートの状態を読み、接続状態をログに出す
    pub fn probe_ports(&self) -> Vec<PortInfo> {
        let ports: Vec<PortInfo> = (0..self.port_count())
            .map(|p| PortInfo::from_portsc(PortNumber(p), self.regs.read_portsc(p)))
            .collect();
        for port in &ports {
            log_port(port);
        }
        ports
    }

    /// ポートをリセットして PR がクリアされるのを待つ
    ///
    /// PED と変更ビットは書き戻さない。タイムアウトはログに残して false。
    pub fn reset_port(&self, port: PortNumber) -> bool {
        if port.as_u8() >= self.port_count() {
            warn!("xHCI: reset of nonexistent port {}", port.one_indexed());
            return false;
        }
        let p = port.as_u8();
        let portsc = self.regs.read_portsc(p);
        self.regs
            .write_portsc(p, (portsc & PORTSC_PRESERVE_BITS) | PORTSC_PR);

        let result = poll_register(
            &self.wait,
            WaitStage::PortReset(port.one_indexed()),
            || self.regs.read_portsc(p),
            |value| value & PORTSC_PR == 0,
        );
        match result {
            Ok(value) => {
                debug!(
                    "Port {}: reset complete (enabled: {})",
                    port.one_indexed(),
                    value & PORTSC_PED != 0
                );
                true
            }
            Err(_) => {
                warn!("Port {}: reset timed out", port.one_indexed());
                false
            }
        }
    }

    /// 変更ビットを W1C でクリア（ポートは無効化しない）
    pub fn clear_port_changes(&self, port: PortNumber, bits: u32) {
        let p = port.as_u8();
        let portsc = self.regs.read_portsc(p);
        self.regs.write_portsc(
            p,
            (portsc & PORTSC_PRESERVE_BITS) | (bits & PORTSC_W1C_BITS),
        );
    }
}
