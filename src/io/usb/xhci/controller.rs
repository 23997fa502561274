// ============================================================================
// src/io/usb/xhci/controller.rs - xHCI Host Controller
// ============================================================================
//!
//! xHCI ホストコントローラの実装。
//!
//! ## 機能
//! - コントローラ初期化とリセット
//! - コマンドリング/イベントリング管理
//! - ポート状態管理 (`port_manager`)
//! - デバイス列挙 (`command`, `device`, `transfer`)
//!
//! コントローラは `discover_and_start` が返す所有値で、グローバル状態は持たない。
//! 複数コンテキストから使う場合は呼び出し側が `spin::Mutex` で包む。

use log::{error, info, warn};

use super::XhciConfig;
use super::device::DeviceTable;
use super::event_handler::{EventDispatcher, ProcessedEvent, parse_event};
use super::initialization::{
    ControllerMemory, ControllerState, PRIMARY_INTERRUPTER, XhciCapabilities, program_controller,
    reset_controller, run_controller,
};
use super::registers::{DoorbellTarget, RegisterIo, XhciRegisters, rt};
use super::trb::Trb;
use super::wait::WaitPolicy;
use crate::io::dma::DmaAllocator;
use crate::io::pci::{ClassCode, PciConfigRead, PciFunction, find_by_class};
use crate::io::usb::{SlotId, UsbError, UsbResult};

// ============================================================================
// xHCI Controller
// ============================================================================

/// xHCIコントローラ
pub struct XhciController<R: RegisterIo, A: DmaAllocator, W: WaitPolicy> {
    /// レジスタブロック
    pub(crate) regs: XhciRegisters<R>,
    /// DMAメモリ
    pub(crate) dma: A,
    /// 待機方針
    pub(crate) wait: W,
    /// ケーパビリティ
    caps: XhciCapabilities,
    /// 設定
    pub(crate) config: XhciConfig,
    /// ライフサイクル状態
    state: ControllerState,
    /// PCI 上の位置（検出経由の場合）
    pci_function: Option<PciFunction>,
    /// コントローラと共有する構造体（起動後のみ）
    pub(crate) memory: Option<ControllerMemory>,
    /// デバイススロット表
    pub(crate) devices: DeviceTable,
    /// イベントの記録先
    pub(crate) events: EventDispatcher,
}

impl<R: RegisterIo, A: DmaAllocator, W: WaitPolicy> XhciController<R, A, W> {
    /// BAR0 のレジスタからコントローラを構築（まだリセットしない）
    pub fn new(io: R, mmio_base: u64, dma: A, wait: W) -> Self {
        Self::with_config(io, mmio_base, dma, wait, XhciConfig::default())
    }

    pub fn with_config(io: R, mmio_base: u64, dma: A, wait: W, config: XhciConfig) -> Self {
        let regs = XhciRegisters::new(io, mmio_base);
        let caps = XhciCapabilities::read(&regs);
        let (major, minor) = caps.version();
        info!(
            "xHCI: version {}.{}, {} slots, {} ports, {} interrupters, {}-byte contexts",
            major,
            minor,
            caps.max_slots,
            caps.max_ports,
            caps.max_interrupters,
            caps.context_layout.entry_size()
        );

        Self {
            regs,
            dma,
            wait,
            caps,
            config,
            state: ControllerState::Uninitialized,
            pci_function: None,
            memory: None,
            devices: DeviceTable::new(),
            events: EventDispatcher::new(),
        }
    }

    // ---- Accessors ----

    pub fn capabilities(&self) -> &XhciCapabilities {
        &self.caps
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ControllerState::Running
    }

    pub fn registers(&self) -> &XhciRegisters<R> {
        &self.regs
    }

    pub fn config(&self) -> &XhciConfig {
        &self.config
    }

    pub fn pci_function(&self) -> Option<&PciFunction> {
        self.pci_function.as_ref()
    }

    pub fn memory(&self) -> Option<&ControllerMemory> {
        self.memory.as_ref()
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    // ---- Lifecycle ----

    /// 停止してリセット
    pub fn reset(&mut self) -> UsbResult<()> {
        self.state = ControllerState::Resetting;
        match reset_controller(&self.regs, &self.wait) {
            Ok(()) => {
                self.state = ControllerState::Ready;
                Ok(())
            }
            Err(e) => {
                error!("xHCI: reset failed: {}", e);
                self.state = ControllerState::Failed;
                Err(e)
            }
        }
    }

    /// 構造体を確保・設定して RUN
    ///
    /// 失敗した場合は確保したメモリをすべて返却する。
    pub fn start(&mut self) -> UsbResult<()> {
        if self.state != ControllerState::Ready {
            return Err(UsbError::NotRunning);
        }

        let memory = match ControllerMemory::allocate(&self.dma, &self.caps, &self.config) {
            Ok(memory) => memory,
            Err(e) => {
                error!("xHCI: failed to allocate controller memory: {}", e);
                self.state = ControllerState::Failed;
                return Err(e.into());
            }
        };
        program_controller(&self.regs, &self.caps, &memory);
        self.memory = Some(memory);

        if let Err(e) = run_controller(&self.regs, &self.wait) {
            error!("xHCI: controller failed to start: {}", e);
            self.release_memory();
            self.state = ControllerState::Failed;
            return Err(e);
        }

        self.state = ControllerState::Running;
        Ok(())
    }

    /// 共有メモリをすべて返却
    fn release_memory(&mut self) {
        self.devices.release_all(&self.dma);
        if let Some(memory) = self.memory.take() {
            memory.release(&self.dma);
        }
    }

    // ---- Command Ring ----

    /// コマンドTRBをエンキューしてドアベル0を鳴らす
    ///
    /// 戻り値はコマンドTRBの物理アドレス（完了イベントとの照合に使う）。
    pub fn post_command(&mut self, trb: Trb) -> UsbResult<u64> {
        if !self.is_running() {
            return Err(UsbError::NotRunning);
        }
        let memory = self.memory.as_mut().ok_or(UsbError::NotRunning)?;
        let address = memory.command_ring.post(&self.regs, trb);
        self.events.expect(address);
        Ok(address)
    }

    // ---- Event Ring ----

    /// イベントを1つ処理
    ///
    /// 未生産（サイクル不一致）なら何もせず false。
    pub fn process_events(&mut self) -> bool {
        pump_event(&self.regs, &mut self.memory, &mut self.events)
    }

    /// 処理できるイベントがなくなるまで処理し、処理数を返す
    pub fn drain_events(&mut self) -> usize {
        let mut count = 0;
        while self.process_events() {
            count += 1;
        }
        count
    }

    /// 記録済みのポート変更（1-based ポート番号）を取り出す
    pub fn take_port_changes(&mut self) -> alloc::vec::Vec<u8> {
        self.events.take_port_changes()
    }

    // ---- Doorbell ----

    /// スロットのドアベルを鳴らす
    pub fn ring_doorbell(&self, slot_id: SlotId, target: DoorbellTarget) {
        self.regs.ring_doorbell(slot_id.as_u8(), target);
    }
}

/// イベントリングから1つ取り出して記録し、ERDP を進める
pub(crate) fn pump_event<R: RegisterIo>(
    regs: &XhciRegisters<R>,
    memory: &mut Option<ControllerMemory>,
    events: &mut EventDispatcher,
) -> bool {
    let Some(memory) = memory.as_mut() else {
        return false;
    };
    let Some(trb) = memory.event_ring.dequeue() else {
        return false;
    };

    let event = parse_event(&trb);
    if let ProcessedEvent::PortStatusChange(change) = event {
        info!("xHCI: Port {} status changed", change.port_id);
    }
    events.dispatch(event);

    regs.write_ir64(PRIMARY_INTERRUPTER, rt::ERDP, memory.event_ring.erdp());
    true
}

// ============================================================================
// Discovery
// ============================================================================

/// PCI 上の最初の xHCI を探す
pub fn find_xhci<P: PciConfigRead + ?Sized>(pci: &P) -> Option<PciFunction> {
    find_by_class(pci, ClassCode::XHCI)
}

/// 検出・リセット・起動を行い、動作中のコントローラを返す
pub fn discover_and_start<P, R, A, W>(
    pci: &P,
    io: R,
    dma: A,
    wait: W,
) -> UsbResult<XhciController<R, A, W>>
where
    P: PciConfigRead + ?Sized,
    R: RegisterIo,
    A: DmaAllocator,
    W: WaitPolicy,
{
    discover_and_start_with_config(pci, io, dma, wait, XhciConfig::default())
}

/// [`discover_and_start`] の設定指定版
pub fn discover_and_start_with_config<P, R, A, W>(
    pci: &P,
    io: R,
    dma: A,
    wait: W,
    config: XhciConfig,
) -> UsbResult<XhciController<R, A, W>>
where
    P: PciConfigRead + ?Sized,
    R: RegisterIo,
    A: DmaAllocator,
    W: WaitPolicy,
{
    let function = find_xhci(pci).ok_or(UsbError::ControllerNotFound)?;
    if function.bar0 == 0 {
        warn!("xHCI: {} has no memory BAR", function.bdf);
        return Err(UsbError::ControllerNotFound);
    }
    info!("xHCI: controller at {}, MMIO base {:#x}", function.bdf, function.bar0);

    let mut controller = XhciController::with_config(io, function.bar0, dma, wait, config);
    controller.pci_function = Some(function);
    controller.reset()?;
    controller.start()?;
    Ok(controller)
}
