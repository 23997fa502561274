// ============================================================================
// tests/util/mod.rs - Simulated xHCI Host Controller
// ============================================================================
//!
//! ホスト上でドライバを動かすためのテスト用ハードウェアモデル。
//!
//! - `SimXhci`: レジスタ空間とコマンド/転送リングを解釈するコントローラ
//! - `FakePci`: 固定テーブルのコンフィグ空間
//! - `CountingWait`: 待機回数を数える WaitPolicy
//! - `CountingDma`: 確保/返却を数え、指定回で失敗するアロケータ
//! - `CaptureSink`: ログ行を集める LineSink
//!
//! DMA はヒープ上のアイデンティティマップなので、シミュレータは
//! 物理アドレスをそのままポインタとして読み書きする。

#![allow(dead_code)]

use std::cell::Cell;
use std::sync::Once;

use hashbrown::HashMap;
use spin::Mutex;

use xhci_kernel::error::MemoryError;
use xhci_kernel::io::dma::{DmaAllocator, DmaBuffer, KernelHeapDma};
use xhci_kernel::io::log::{LineSink, init_with_sink};
use xhci_kernel::io::pci::PciConfigRead;
use xhci_kernel::io::usb::xhci::{RegisterIo, Trb, WaitPolicy};

// ============================================================================
// Register Map
// ============================================================================

pub const MMIO_BASE: u64 = 0xFEBF_0000;
pub const CAP_LENGTH: u64 = 0x20;
pub const OP_BASE: u64 = MMIO_BASE + CAP_LENGTH;
pub const RT_BASE: u64 = MMIO_BASE + 0x1000;
pub const DB_BASE: u64 = MMIO_BASE + 0x2000;

pub const USBCMD: u64 = OP_BASE;
pub const USBSTS: u64 = OP_BASE + 0x04;
pub const PAGESIZE: u64 = OP_BASE + 0x08;
pub const CRCR: u64 = OP_BASE + 0x18;
pub const DCBAAP: u64 = OP_BASE + 0x30;
pub const CONFIG: u64 = OP_BASE + 0x38;
pub const PORTSC_BASE: u64 = OP_BASE + 0x400;

pub const IMAN: u64 = RT_BASE + 0x20;
pub const ERSTSZ: u64 = RT_BASE + 0x28;
pub const ERSTBA: u64 = RT_BASE + 0x30;
pub const ERDP: u64 = RT_BASE + 0x38;

const CMD_RUN: u32 = 1 << 0;
const CMD_HCRST: u32 = 1 << 1;
const STS_HCH: u32 = 1 << 0;
const STS_CNR: u32 = 1 << 11;

pub const PORTSC_CCS: u32 = 1 << 0;
pub const PORTSC_PED: u32 = 1 << 1;
pub const PORTSC_PR: u32 = 1 << 4;
pub const PORTSC_PP: u32 = 1 << 9;
pub const PORTSC_CSC: u32 = 1 << 17;
pub const PORTSC_PRC: u32 = 1 << 21;
const PORTSC_W1C: u32 = 0x7F << 17;

const TRB_ISP: u32 = 1 << 2;
const TRB_IOC: u32 = 1 << 5;

/// 接続済み・電源オンのポート（速度コード付き、CSC 立ち）
pub fn connected_port(speed_code: u32) -> u32 {
    PORTSC_CCS | PORTSC_PP | PORTSC_CSC | (speed_code << 10)
}

pub fn empty_port() -> u32 {
    PORTSC_PP
}

// TRB types / completion codes used by the model
const TRB_SETUP: u8 = 2;
const TRB_DATA: u8 = 3;
const TRB_STATUS: u8 = 4;
const TRB_LINK: u8 = 6;
const TRB_ENABLE_SLOT: u8 = 9;
const TRB_DISABLE_SLOT: u8 = 10;
const TRB_ADDRESS_DEVICE: u8 = 11;
const TRB_NOOP_COMMAND: u8 = 23;
const TRB_TRANSFER_EVENT: u32 = 32;
const TRB_COMMAND_COMPLETION: u32 = 33;

pub const CC_SUCCESS: u32 = 1;
pub const CC_TRB_ERROR: u32 = 5;
pub const CC_STALL: u32 = 6;
pub const CC_NO_SLOTS: u32 = 9;
pub const CC_SHORT_PACKET: u32 = 13;
pub const CC_CONTEXT_STATE: u32 = 19;

// ============================================================================
// Device Model
// ============================================================================

/// 接続デバイスが返すディスクリプタ
#[derive(Debug, Clone)]
pub struct DeviceModel {
    pub device_descriptor: Vec<u8>,
    pub config_descriptor: Vec<u8>,
}

impl DeviceModel {
    /// HID ブートキーボード (1 interface, interrupt IN)
    pub fn boot_keyboard() -> Self {
        Self {
            device_descriptor: vec![
                18, 1, 0x00, 0x02, 0, 0, 0, 64, 0x6D, 0x04, 0x1D, 0xC3, 0x00, 0x01, 1, 2, 0, 1,
            ],
            config_descriptor: vec![
                9, 2, 34, 0, 1, 1, 0, 0xA0, 50, // configuration
                9, 4, 0, 0, 1, 3, 1, 1, 0, // interface: HID boot keyboard
                9, 0x21, 0x11, 0x01, 0, 1, 0x22, 63, 0, // HID
                7, 5, 0x81, 3, 8, 0, 10, // endpoint 1 IN interrupt
            ],
        }
    }

    /// マスストレージ（ブートキーボードではない）
    pub fn mass_storage() -> Self {
        Self {
            device_descriptor: vec![
                18, 1, 0x00, 0x03, 0, 0, 0, 9, 0x81, 0x07, 0x81, 0x55, 0x00, 0x01, 1, 2, 3, 1,
            ],
            config_descriptor: vec![
                9, 2, 32, 0, 1, 2, 0, 0x80, 50, // configuration 2
                9, 4, 0, 0, 2, 8, 6, 0x50, 0, // interface: mass storage
                7, 5, 0x81, 2, 0x00, 0x04, 0, // bulk IN
                7, 5, 0x02, 2, 0x00, 0x04, 0, // bulk OUT
            ],
        }
    }
}

// ============================================================================
// Simulator Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub max_slots: u8,
    pub hccparams1: u32,
    pub scratchpad_buffers: u16,
    /// 初期 PORTSC（ポート数 = 要素数）
    pub ports: Vec<u32>,
    /// RUN を落としても HCH が立たない
    pub never_halts: bool,
    /// HCRST が自動でクリアされない
    pub reset_stuck: bool,
    /// リセット後に CNR が立ったままの USBSTS 読み取り回数
    pub cnr_reads: u32,
    /// RUN を立てても HCH が落ちない
    pub never_runs: bool,
    /// PR がクリアされないポート (0-based)
    pub stuck_reset_ports: Vec<u8>,
    /// 接続デバイス
    pub device: DeviceModel,
    /// Address Device の完了コードを上書き
    pub address_completion: Option<u32>,
    /// EP0 が常に STALL を返す
    pub stall_ep0: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_slots: 32,
            hccparams1: 0,
            scratchpad_buffers: 0,
            ports: vec![empty_port(); 4],
            never_halts: false,
            reset_stuck: false,
            cnr_reads: 0,
            never_runs: false,
            stuck_reset_ports: Vec::new(),
            device: DeviceModel::boot_keyboard(),
            address_completion: None,
            stall_ep0: false,
        }
    }
}

// ============================================================================
// Raw memory access
// ============================================================================

fn mem_read_u32(addr: u64) -> u32 {
    // SAFETY: アドレスはドライバが KernelHeapDma から確保したヒープ領域
    unsafe { core::ptr::read_volatile(addr as *const u32) }
}

fn mem_write_u32(addr: u64, value: u32) {
    // SAFETY: 同上
    unsafe { core::ptr::write_volatile(addr as *mut u32, value) }
}

fn mem_read_u64(addr: u64) -> u64 {
    (mem_read_u32(addr) as u64) | ((mem_read_u32(addr + 4) as u64) << 32)
}

fn mem_write_u64(addr: u64, value: u64) {
    mem_write_u32(addr, value as u32);
    mem_write_u32(addr + 4, (value >> 32) as u32);
}

fn mem_read_trb(addr: u64) -> Trb {
    Trb {
        parameter: mem_read_u64(addr),
        status: mem_read_u32(addr + 8),
        control: mem_read_u32(addr + 12),
    }
}

fn mem_write_bytes(addr: u64, bytes: &[u8]) {
    for (i, byte) in bytes.iter().enumerate() {
        // SAFETY: データステージのバウンスバッファ内
        unsafe { core::ptr::write_volatile((addr + i as u64) as *mut u8, *byte) }
    }
}

// ============================================================================
// Simulator
// ============================================================================

/// 1回のコントロール転送で消費した TRB
#[derive(Debug, Clone)]
pub struct RecordedTransfer {
    pub slot: u8,
    pub trbs: Vec<Trb>,
}

struct EndpointState {
    dequeue: u64,
    cycle: bool,
}

struct SimState {
    config: SimConfig,
    usbcmd: u32,
    usbsts: u32,
    cnr_remaining: u32,
    portsc: Vec<u32>,
    /// その他のレジスタ（DCBAAP, CONFIG, CRCR, 割り込みレジスタ）
    regs: HashMap<u64, u32>,
    command_dequeue: u64,
    command_cycle: bool,
    event_base: u64,
    event_size: u32,
    event_enqueue: u32,
    event_cycle: bool,
    next_slot: u8,
    endpoints: HashMap<u8, EndpointState>,
    configured: HashMap<u8, u8>,
    writes: Vec<(u64, u32)>,
    doorbells: Vec<(u8, u32)>,
    commands: Vec<Trb>,
    transfers: Vec<RecordedTransfer>,
    ped_written: bool,
    drop_transfer_events: bool,
    hold_transfer_events: bool,
    held_events: Vec<Trb>,
}

/// シミュレートされた xHCI コントローラ（BIOS から RUN 状態で引き継ぐ）
pub struct SimXhci {
    state: Mutex<SimState>,
}

impl SimXhci {
    pub fn new(config: SimConfig) -> Self {
        let portsc = config.ports.clone();
        Self {
            state: Mutex::new(SimState {
                config,
                usbcmd: CMD_RUN,
                usbsts: 0,
                cnr_remaining: 0,
                portsc,
                regs: HashMap::new(),
                command_dequeue: 0,
                command_cycle: true,
                event_base: 0,
                event_size: 0,
                event_enqueue: 0,
                event_cycle: true,
                next_slot: 1,
                endpoints: HashMap::new(),
                configured: HashMap::new(),
                writes: Vec::new(),
                doorbells: Vec::new(),
                commands: Vec::new(),
                transfers: Vec::new(),
                ped_written: false,
                drop_transfer_events: false,
                hold_transfer_events: false,
                held_events: Vec::new(),
            }),
        }
    }

    /// ポート 1 にブートキーボードが接続された High-speed 構成
    pub fn with_keyboard() -> Self {
        let mut config = SimConfig::default();
        config.ports[0] = connected_port(3);
        Self::new(config)
    }

    pub fn writes(&self) -> Vec<(u64, u32)> {
        self.state.lock().writes.clone()
    }

    /// `addr` への最後の書き込み位置
    pub fn last_write_index(&self, addr: u64) -> Option<usize> {
        self.state.lock().writes.iter().rposition(|(a, _)| *a == addr)
    }

    pub fn register(&self, addr: u64) -> u32 {
        self.state.lock().regs.get(&addr).copied().unwrap_or(0)
    }

    pub fn register64(&self, addr: u64) -> u64 {
        (self.register(addr) as u64) | ((self.register(addr + 4) as u64) << 32)
    }

    pub fn usbcmd(&self) -> u32 {
        self.state.lock().usbcmd
    }

    pub fn doorbells(&self) -> Vec<(u8, u32)> {
        self.state.lock().doorbells.clone()
    }

    pub fn commands(&self) -> Vec<Trb> {
        self.state.lock().commands.clone()
    }

    pub fn transfers(&self) -> Vec<RecordedTransfer> {
        self.state.lock().transfers.clone()
    }

    pub fn portsc(&self, port: usize) -> u32 {
        self.state.lock().portsc[port]
    }

    pub fn set_portsc(&self, port: usize, value: u32) {
        self.state.lock().portsc[port] = value;
    }

    /// PED に 1 が書かれたことがあるか
    pub fn ped_written(&self) -> bool {
        self.state.lock().ped_written
    }

    /// 転送は処理するが Transfer Event を生成しない
    pub fn drop_transfer_events(&self, drop: bool) {
        self.state.lock().drop_transfer_events = drop;
    }

    /// Transfer Event を保留し、`release_held_events` まで届けない
    pub fn hold_transfer_events(&self, hold: bool) {
        self.state.lock().hold_transfer_events = hold;
    }

    /// 保留した Transfer Event をイベントリングへ積む
    pub fn release_held_events(&self) -> usize {
        let mut state = self.state.lock();
        let held = core::mem::take(&mut state.held_events);
        let count = held.len();
        for event in held {
            state.post_event(event);
        }
        count
    }

    pub fn configuration(&self, slot: u8) -> Option<u8> {
        self.state.lock().configured.get(&slot).copied()
    }

    /// 現在のイベントリングへポート変更イベントを積む
    pub fn inject_port_change(&self, port_one_indexed: u8) {
        let mut state = self.state.lock();
        state.post_event(Trb {
            parameter: (port_one_indexed as u64) << 24,
            status: CC_SUCCESS << 24,
            control: 34 << 10,
        });
    }
}

impl SimState {
    fn read_cap(&self, offset: u64) -> u32 {
        let ports = self.config.ports.len() as u32;
        match offset {
            0x00 => (0x0110 << 16) | CAP_LENGTH as u32,
            0x04 => (ports << 24) | (1 << 8) | self.config.max_slots as u32,
            0x08 => {
                let sp = self.config.scratchpad_buffers as u32;
                ((sp >> 5) & 0x1F) << 21 | (sp & 0x1F) << 27
            }
            0x10 => self.config.hccparams1,
            0x14 => (DB_BASE - MMIO_BASE) as u32,
            0x18 => (RT_BASE - MMIO_BASE) as u32,
            _ => 0,
        }
    }

    fn port_index(&self, addr: u64) -> Option<usize> {
        if addr < PORTSC_BASE || (addr - PORTSC_BASE) % 0x10 != 0 {
            return None;
        }
        let port = ((addr - PORTSC_BASE) / 0x10) as usize;
        (port < self.portsc.len()).then_some(port)
    }

    fn read(&mut self, addr: u64) -> u32 {
        if (MMIO_BASE..OP_BASE).contains(&addr) {
            return self.read_cap(addr - MMIO_BASE);
        }
        match addr {
            USBCMD => self.usbcmd,
            USBSTS => {
                if self.cnr_remaining > 0 {
                    self.cnr_remaining -= 1;
                    self.usbsts | STS_CNR
                } else {
                    self.usbsts
                }
            }
            PAGESIZE => 1,
            _ => match self.port_index(addr) {
                Some(port) => self.portsc[port],
                None => self.regs.get(&addr).copied().unwrap_or(0),
            },
        }
    }

    fn write(&mut self, addr: u64, value: u32) {
        self.writes.push((addr, value));
        match addr {
            USBCMD => self.write_usbcmd(value),
            USBSTS => self.usbsts &= !(value & !STS_HCH),
            a if (DB_BASE..DB_BASE + 256 * 4).contains(&a) => {
                let index = ((a - DB_BASE) / 4) as u8;
                self.doorbells.push((index, value));
                if index == 0 {
                    self.process_commands();
                } else {
                    self.process_transfers(index);
                }
            }
            _ => {
                if let Some(port) = self.port_index(addr) {
                    self.write_portsc(port, value);
                    return;
                }
                self.regs.insert(addr, value);
                if addr == CRCR || addr == CRCR + 4 {
                    let crcr = self.reg64(CRCR);
                    self.command_dequeue = crcr & !0x3F;
                    self.command_cycle = crcr & 1 != 0;
                }
                if addr == ERSTBA + 4 {
                    self.load_erst();
                }
            }
        }
    }

    fn reg64(&self, addr: u64) -> u64 {
        let low = self.regs.get(&addr).copied().unwrap_or(0) as u64;
        let high = self.regs.get(&(addr + 4)).copied().unwrap_or(0) as u64;
        (high << 32) | low
    }

    fn write_usbcmd(&mut self, value: u32) {
        if value & CMD_HCRST != 0 {
            if self.config.reset_stuck {
                self.usbcmd = value;
                return;
            }
            self.usbcmd = 0;
            self.usbsts = STS_HCH;
            self.cnr_remaining = self.config.cnr_reads;
            self.regs.clear();
            self.event_base = 0;
            self.event_size = 0;
            return;
        }
        self.usbcmd = value;
        if value & CMD_RUN != 0 {
            if !self.config.never_runs {
                self.usbsts &= !STS_HCH;
            }
        } else if !self.config.never_halts {
            self.usbsts |= STS_HCH;
        }
    }

    fn write_portsc(&mut self, port: usize, value: u32) {
        let mut current = self.portsc[port];
        if value & PORTSC_PED != 0 {
            self.ped_written = true;
            current &= !PORTSC_PED;
        }
        current &= !(value & PORTSC_W1C);
        current = (current & !PORTSC_PP) | (value & PORTSC_PP);
        if value & PORTSC_PR != 0 {
            if self.config.stuck_reset_ports.contains(&(port as u8)) {
                current |= PORTSC_PR;
            } else if current & PORTSC_CCS != 0 {
                current = (current & !PORTSC_PR) | PORTSC_PED | PORTSC_PRC;
            }
        }
        self.portsc[port] = current;
    }

    // ---- Event ring ----

    fn load_erst(&mut self) {
        let erst = self.reg64(ERSTBA);
        if erst == 0 {
            return;
        }
        self.event_base = mem_read_u64(erst);
        self.event_size = mem_read_u32(erst + 8) & 0xFFFF;
        self.event_enqueue = 0;
        self.event_cycle = true;
    }

    fn post_event(&mut self, mut event: Trb) {
        if self.event_base == 0 || self.event_size == 0 {
            return;
        }
        let addr = self.event_base + self.event_enqueue as u64 * 16;
        event.set_cycle_bit(self.event_cycle);
        mem_write_u64(addr, event.parameter);
        mem_write_u32(addr + 8, event.status);
        mem_write_u32(addr + 12, event.control);
        self.event_enqueue += 1;
        if self.event_enqueue == self.event_size {
            self.event_enqueue = 0;
            self.event_cycle = !self.event_cycle;
        }
    }

    // ---- Command ring ----

    fn process_commands(&mut self) {
        loop {
            let addr = self.command_dequeue;
            let trb = mem_read_trb(addr);
            if trb.cycle_bit() != self.command_cycle {
                break;
            }
            if trb.trb_type() == TRB_LINK {
                if trb.control & (1 << 1) != 0 {
                    self.command_cycle = !self.command_cycle;
                }
                self.command_dequeue = trb.parameter & !0xF;
                continue;
            }
            self.command_dequeue += 16;
            self.commands.push(trb);

            let (code, slot) = match trb.trb_type() {
                TRB_NOOP_COMMAND => (CC_SUCCESS, 0),
                TRB_ENABLE_SLOT => {
                    if self.next_slot > self.config.max_slots {
                        (CC_NO_SLOTS, 0)
                    } else {
                        let slot = self.next_slot;
                        self.next_slot += 1;
                        (CC_SUCCESS, slot)
                    }
                }
                TRB_DISABLE_SLOT => {
                    let slot = (trb.control >> 24) as u8;
                    self.endpoints.remove(&slot);
                    (CC_SUCCESS, slot)
                }
                TRB_ADDRESS_DEVICE => self.address_device(&trb),
                _ => (CC_TRB_ERROR, 0),
            };
            self.post_event(Trb {
                parameter: addr,
                status: code << 24,
                control: (TRB_COMMAND_COMPLETION << 10) | ((slot as u32) << 24),
            });
        }
    }

    fn address_device(&mut self, trb: &Trb) -> (u32, u8) {
        let slot = (trb.control >> 24) as u8;
        let input = trb.parameter & !0xF;
        let entry = if self.config.hccparams1 & (1 << 2) != 0 { 64 } else { 32 };

        let dcbaa = self.reg64(DCBAAP);
        let output = mem_read_u64(dcbaa + slot as u64 * 8);
        if output == 0 {
            return (CC_CONTEXT_STATE, slot);
        }
        if let Some(code) = self.config.address_completion {
            return (code, slot);
        }

        // Input: [control][slot][ep0] / Output: [slot][ep0]
        for i in 0..8 {
            mem_write_u32(output + i * 4, mem_read_u32(input + entry + i * 4));
            mem_write_u32(output + entry + i * 4, mem_read_u32(input + 2 * entry + i * 4));
        }
        // Slot State = Addressed, USB Device Address = slot
        mem_write_u32(output + 12, (2 << 27) | slot as u32);

        let dequeue = mem_read_u64(input + 2 * entry + 8);
        self.endpoints.insert(
            slot,
            EndpointState {
                dequeue: dequeue & !0xF,
                cycle: dequeue & 1 != 0,
            },
        );
        (CC_SUCCESS, slot)
    }

    // ---- EP0 ----

    fn process_transfers(&mut self, slot: u8) {
        let Some(ep) = self.endpoints.get_mut(&slot) else {
            return;
        };
        let mut dequeue = ep.dequeue;
        let mut cycle = ep.cycle;
        let mut pending: Vec<(u64, Trb)> = Vec::new();
        let mut completed = Vec::new();
        loop {
            let trb = mem_read_trb(dequeue);
            if trb.cycle_bit() != cycle {
                break;
            }
            if trb.trb_type() == TRB_LINK {
                if trb.control & (1 << 1) != 0 {
                    cycle = !cycle;
                }
                dequeue = trb.parameter & !0xF;
                continue;
            }
            pending.push((dequeue, trb));
            dequeue += 16;
            if trb.trb_type() == TRB_STATUS {
                completed.push(core::mem::take(&mut pending));
            }
        }
        ep.dequeue = dequeue;
        ep.cycle = cycle;

        for stages in completed {
            self.complete_control(slot, stages);
        }
    }

    fn complete_control(&mut self, slot: u8, stages: Vec<(u64, Trb)>) {
        let status_addr = stages.last().map(|(addr, _)| *addr).unwrap_or(0);
        let setup = stages
            .iter()
            .find(|(_, t)| t.trb_type() == TRB_SETUP)
            .map(|(_, t)| t.parameter)
            .unwrap_or(0);
        let data = stages
            .iter()
            .find(|(_, t)| t.trb_type() == TRB_DATA)
            .map(|(addr, t)| (*addr, *t));

        let request = ((setup >> 8) & 0xFF) as u8;
        let value = ((setup >> 16) & 0xFFFF) as u16;

        // Ok(データステージの残り) / Err(STALL)
        let result = if self.config.stall_ep0 {
            Err(())
        } else {
            match request {
                // GET_DESCRIPTOR
                6 => {
                    let bytes = match value >> 8 {
                        1 => Some(self.config.device.device_descriptor.clone()),
                        2 => Some(self.config.device.config_descriptor.clone()),
                        _ => None,
                    };
                    match (bytes, data) {
                        (Some(bytes), Some((_, trb))) => {
                            let len = trb.status & 0x1FFFF;
                            let n = (len as usize).min(bytes.len());
                            mem_write_bytes(trb.parameter, &bytes[..n]);
                            Ok(len - n as u32)
                        }
                        _ => Err(()),
                    }
                }
                // SET_CONFIGURATION
                9 => {
                    self.configured.insert(slot, value as u8);
                    Ok(0)
                }
                _ => Ok(0),
            }
        };

        self.transfers.push(RecordedTransfer {
            slot,
            trbs: stages.iter().map(|(_, t)| *t).collect(),
        });

        match result {
            // データステージ（なければステータスステージ）で STALL
            Err(()) => {
                let (addr, residual) = match data {
                    Some((addr, trb)) => (addr, trb.status & 0x1FFFF),
                    None => (status_addr, 0),
                };
                self.emit_transfer_event(slot, addr, CC_STALL, residual);
            }
            Ok(residual) => {
                if let Some((addr, trb)) = data {
                    // 短い転送は ISP があるときだけ報告される
                    if residual > 0 && trb.control & TRB_ISP != 0 {
                        self.emit_transfer_event(slot, addr, CC_SHORT_PACKET, residual);
                    } else if trb.control & TRB_IOC != 0 {
                        self.emit_transfer_event(slot, addr, CC_SUCCESS, residual);
                    }
                }
                self.emit_transfer_event(slot, status_addr, CC_SUCCESS, 0);
            }
        }
    }

    fn emit_transfer_event(&mut self, slot: u8, trb_pointer: u64, code: u32, residual: u32) {
        if self.drop_transfer_events {
            return;
        }
        let event = Trb {
            parameter: trb_pointer,
            status: (code << 24) | residual,
            control: (TRB_TRANSFER_EVENT << 10) | (1 << 16) | ((slot as u32) << 24),
        };
        if self.hold_transfer_events {
            self.held_events.push(event);
        } else {
            self.post_event(event);
        }
    }
}

impl RegisterIo for SimXhci {
    fn read32(&self, addr: u64) -> u32 {
        self.state.lock().read(addr)
    }

    fn write32(&self, addr: u64, value: u32) {
        self.state.lock().write(addr, value)
    }
}

// ============================================================================
// PCI
// ============================================================================

/// 1ファンクションだけのコンフィグ空間
pub struct FakePci {
    functions: HashMap<(u8, u8, u8), [u32; 6]>,
}

impl FakePci {
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// QEMU qemu-xhci (1b36:000d) を 64 ビット BAR で配置
    pub fn with_xhci(bus: u8, device: u8, bar0: u64) -> Self {
        let mut pci = Self::empty();
        pci.functions.insert(
            (bus, device, 0),
            [0x000D_1B36, 0, 0x0C03_3001, 0, (bar0 as u32) | 0x4, (bar0 >> 32) as u32],
        );
        pci
    }

    /// クラスだけ違うファンクションを追加
    pub fn add_function(&mut self, bus: u8, device: u8, class_reg: u32) {
        self.functions
            .insert((bus, device, 0), [0x1234_8086, 0, class_reg, 0, 0xFEB0_0000, 0]);
    }
}

impl PciConfigRead for FakePci {
    fn read_config(&self, bus: u8, device: u8, function: u8, offset: u8) -> u32 {
        self.functions
            .get(&(bus, device, function))
            .map(|regs| regs.get((offset / 4) as usize).copied().unwrap_or(0))
            .unwrap_or(0xFFFF_FFFF)
    }
}

// ============================================================================
// Wait / DMA
// ============================================================================

/// 待機回数を数えるだけの WaitPolicy
pub struct CountingWait {
    budget: u32,
    delays: Cell<u32>,
}

impl CountingWait {
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            delays: Cell::new(0),
        }
    }

    pub fn delays(&self) -> u32 {
        self.delays.get()
    }

    pub fn reset_count(&self) {
        self.delays.set(0);
    }
}

impl Default for CountingWait {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl WaitPolicy for CountingWait {
    fn budget(&self) -> u32 {
        self.budget
    }

    fn delay(&self) {
        self.delays.set(self.delays.get() + 1);
    }
}

/// 確保/返却を数え、`fail_at` 回目の確保を失敗させる
pub struct CountingDma {
    inner: KernelHeapDma,
    attempts: Cell<usize>,
    allocations: Cell<usize>,
    releases: Cell<usize>,
    fail_at: Option<usize>,
}

impl CountingDma {
    pub fn new() -> Self {
        Self {
            inner: KernelHeapDma::new(),
            attempts: Cell::new(0),
            allocations: Cell::new(0),
            releases: Cell::new(0),
            fail_at: None,
        }
    }

    /// n 回目（1始まり）の確保で失敗する
    pub fn failing_at(n: usize) -> Self {
        Self {
            fail_at: Some(n),
            ..Self::new()
        }
    }

    pub fn allocations(&self) -> usize {
        self.allocations.get()
    }

    pub fn releases(&self) -> usize {
        self.releases.get()
    }

    pub fn live(&self) -> usize {
        self.allocations.get() - self.releases.get()
    }
}

impl DmaAllocator for CountingDma {
    fn allocate(&self, size: usize, align: usize) -> Result<DmaBuffer, MemoryError> {
        let attempt = self.attempts.get() + 1;
        self.attempts.set(attempt);
        if self.fail_at == Some(attempt) {
            return Err(MemoryError::DmaAllocationFailed);
        }
        let buffer = self.inner.allocate(size, align)?;
        self.allocations.set(self.allocations.get() + 1);
        Ok(buffer)
    }

    fn release(&self, buffer: DmaBuffer) {
        self.releases.set(self.releases.get() + 1);
        self.inner.release(buffer);
    }
}

// ============================================================================
// Log capture
// ============================================================================

pub struct CaptureSink {
    lines: Mutex<Vec<String>>,
}

impl LineSink for CaptureSink {
    fn write_line(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

static CAPTURE: CaptureSink = CaptureSink {
    lines: Mutex::new(Vec::new()),
};

/// キャプチャシンクをグローバルロガーに設定（プロセスで1回）
pub fn capture_logs() -> &'static CaptureSink {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = init_with_sink(&CAPTURE);
    });
    &CAPTURE
}

impl CaptureSink {
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }

    pub fn lines_matching(&self, needle: &str) -> Vec<String> {
        self.lines
            .lock()
            .iter()
            .filter(|line| line.contains(needle))
            .cloned()
            .collect()
    }
}
