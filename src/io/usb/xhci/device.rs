// ============================================================================
// src/io/usb/xhci/device.rs - xHCI Device Slots and Enumeration
// ============================================================================
//!
//! デバイススロット表とデバイス列挙。
//!
//! ## 列挙フロー
//! 1. ポートリセット
//! 2. Enable Slot
//! 3. Address Device（入力コンテキスト・EP0 転送リング・DCBAA）
//! 4. デバイスディスクリプタ取得
//! 5. コンフィグレーションディスクリプタ取得とパース
//! 6. SET_CONFIGURATION

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, info, warn};

use super::context::{DeviceContext, EndpointContext, InputContext, InputControlContext, SlotContext};
use super::controller::XhciController;
use super::port_manager::{PORTSC_CSC, PORTSC_PRC};
use super::registers::RegisterIo;
use super::ring_manager::TransferRing;
use super::trb::Trb;
use super::wait::WaitPolicy;
use crate::io::dma::DmaAllocator;
use crate::io::usb::descriptor::{
    ConfigurationDescriptor, DeviceDescriptor, FromDescriptorBytes, ParsedConfiguration,
    parse_configuration,
};
use crate::io::usb::{DeviceAddress, PortNumber, SlotId, UsbError, UsbResult, UsbSpeed};

/// デバイススロット表のサイズ（スロットIDは 1..=255）
pub const MAX_DEVICE_SLOTS: usize = 255;

/// EP0 の DCI
const EP0_DCI: usize = 1;

// ============================================================================
// Device Slot Table
// ============================================================================

/// 1スロット分のデバイス情報
#[derive(Debug)]
pub struct UsbDeviceSlot {
    pub slot_id: SlotId,
    pub port: Option<PortNumber>,
    pub speed: Option<UsbSpeed>,
    pub address: DeviceAddress,
    pub in_use: bool,
    pub(crate) device_context: Option<DeviceContext>,
    pub(crate) input_context: Option<InputContext>,
    pub(crate) ep0_ring: Option<TransferRing>,
}

impl UsbDeviceSlot {
    fn empty() -> Self {
        Self {
            slot_id: SlotId::INVALID,
            port: None,
            speed: None,
            address: DeviceAddress::UNASSIGNED,
            in_use: false,
            device_context: None,
            input_context: None,
            ep0_ring: None,
        }
    }

    /// Address Device 済みか
    pub fn is_addressed(&self) -> bool {
        self.in_use && self.device_context.is_some()
    }

    pub fn device_context(&self) -> Option<&DeviceContext> {
        self.device_context.as_ref()
    }

    pub fn input_context(&self) -> Option<&InputContext> {
        self.input_context.as_ref()
    }

    pub fn ep0_ring(&self) -> Option<&TransferRing> {
        self.ep0_ring.as_ref()
    }

    fn release<A: DmaAllocator + ?Sized>(&mut self, dma: &A) {
        if let Some(ring) = self.ep0_ring.take() {
            ring.release(dma);
        }
        if let Some(input) = self.input_context.take() {
            input.release(dma);
        }
        if let Some(device) = self.device_context.take() {
            device.release(dma);
        }
        *self = Self::empty();
    }
}

/// スロットID - 1 で引く固定長のデバイス表
#[derive(Debug)]
pub struct DeviceTable {
    slots: Box<[UsbDeviceSlot]>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_DEVICE_SLOTS).map(|_| UsbDeviceSlot::empty()).collect(),
        }
    }

    fn index(slot_id: SlotId) -> Option<usize> {
        match slot_id.as_usize() {
            0 => None,
            id if id <= MAX_DEVICE_SLOTS => Some(id - 1),
            _ => None,
        }
    }

    pub fn get(&self, slot_id: SlotId) -> Option<&UsbDeviceSlot> {
        Self::index(slot_id).map(|i| &self.slots[i])
    }

    pub fn get_mut(&mut self, slot_id: SlotId) -> Option<&mut UsbDeviceSlot> {
        Self::index(slot_id).map(|i| &mut self.slots[i])
    }

    /// Enable Slot の結果を記録
    pub fn claim(&mut self, slot_id: SlotId) -> UsbResult<()> {
        let slot = self.get_mut(slot_id).ok_or(UsbError::InvalidParameter)?;
        if slot.in_use {
            warn!("xHCI: slot {} handed out twice", slot_id);
            return Err(UsbError::InvalidParameter);
        }
        slot.in_use = true;
        slot.slot_id = slot_id;
        Ok(())
    }

    /// スロットの資源を返却して空にする
    pub fn release<A: DmaAllocator + ?Sized>(&mut self, slot_id: SlotId, dma: &A) {
        if let Some(slot) = self.get_mut(slot_id) {
            slot.release(dma);
        }
    }

    pub fn release_all<A: DmaAllocator + ?Sized>(&mut self, dma: &A) {
        for slot in self.slots.iter_mut().filter(|s| s.in_use) {
            slot.release(dma);
        }
    }

    pub fn in_use(&self) -> impl Iterator<Item = &UsbDeviceSlot> {
        self.slots.iter().filter(|s| s.in_use)
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Enumeration Result
// ============================================================================

/// 列挙済みデバイスの要約
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratedDevice {
    pub port: PortNumber,
    pub slot_id: SlotId,
    pub address: DeviceAddress,
    pub speed: UsbSpeed,
    pub device: DeviceDescriptor,
    pub configuration: ParsedConfiguration,
    /// HID ブートキーボードのインターフェースを持つか
    pub boot_keyboard: bool,
}

// ============================================================================
// Address Device / Enumeration
// ============================================================================

impl<R: RegisterIo, A: DmaAllocator, W: WaitPolicy> XhciController<R, A, W> {
    /// Address Device コマンドでデバイスにアドレスを割り当てる
    ///
    /// DCBAA[slot] はコマンド発行前に設定し、失敗したらクリアする。
    pub fn address_device(
        &mut self,
        slot_id: SlotId,
        port: PortNumber,
        speed: UsbSpeed,
    ) -> UsbResult<DeviceAddress> {
        if !self.devices.get(slot_id).is_some_and(|s| s.in_use) {
            return Err(UsbError::DeviceNotFound);
        }
        if self.memory.is_none() {
            return Err(UsbError::NotRunning);
        }
        let layout = self.capabilities().context_layout;

        let device = DeviceContext::allocate(&self.dma, layout)?;
        let mut input = match InputContext::allocate(&self.dma, layout) {
            Ok(input) => input,
            Err(e) => {
                device.release(&self.dma);
                return Err(e.into());
            }
        };
        let ring = match TransferRing::allocate(&self.dma, self.config.ring_size) {
            Ok(ring) => ring,
            Err(e) => {
                input.release(&self.dma);
                device.release(&self.dma);
                return Err(e.into());
            }
        };

        let (dequeue, dcs) = ring.dequeue_pointer();
        input.set_control(InputControlContext::address_device());
        input.set_slot(SlotContext::for_root_port(speed, port));
        input.set_endpoint(
            EP0_DCI,
            EndpointContext::control(speed.default_max_packet_size(), dequeue, dcs),
        );

        if let Some(memory) = self.memory.as_mut() {
            memory.dcbaa.set(slot_id, device.phys_addr());
        }

        let trb = Trb::address_device(input.phys_addr(), slot_id, false);
        if let Err(e) = self.execute_command(trb) {
            if let Some(memory) = self.memory.as_mut() {
                memory.dcbaa.clear(slot_id);
            }
            ring.release(&self.dma);
            input.release(&self.dma);
            device.release(&self.dma);
            return Err(e);
        }

        let address = DeviceAddress(device.slot().device_address());
        if let Some(slot) = self.devices.get_mut(slot_id) {
            slot.port = Some(port);
            slot.speed = Some(speed);
            slot.address = address;
            slot.device_context = Some(device);
            slot.input_context = Some(input);
            slot.ep0_ring = Some(ring);
        }
        info!(
            "xHCI: slot {} on port {} addressed as device {}",
            slot_id,
            port.one_indexed(),
            address.as_u8()
        );
        Ok(address)
    }

    /// ポートに接続されたデバイスを列挙する
    pub fn enumerate_device(&mut self, port: PortNumber) -> UsbResult<EnumeratedDevice> {
        info!("=== Enumerating device on port {} ===", port.one_indexed());

        let before = self.port_info(port).ok_or(UsbError::InvalidParameter)?;
        if !before.connected {
            return Err(UsbError::DeviceNotFound);
        }
        if self.reset_port(port) {
            self.clear_port_changes(port, PORTSC_PRC);
        } else {
            warn!("Port {}: continuing without reset completion", port.one_indexed());
        }

        // リセット後に速度が確定する
        let speed = self
            .port_info(port)
            .and_then(|info| info.speed)
            .or(before.speed)
            .ok_or(UsbError::DeviceNotFound)?;

        let slot_id = self.enable_slot()?;
        match self.configure_device(slot_id, port, speed) {
            Ok(device) => {
                info!("Device enumeration complete for port {}", port.one_indexed());
                Ok(device)
            }
            Err(e) => {
                warn!("Port {}: enumeration failed: {}", port.one_indexed(), e);
                Err(e)
            }
        }
    }

    fn configure_device(
        &mut self,
        slot_id: SlotId,
        port: PortNumber,
        speed: UsbSpeed,
    ) -> UsbResult<EnumeratedDevice> {
        let address = self.address_device(slot_id, port, speed)?;
        let device = self.get_device_descriptor(slot_id)?;

        // まずヘッダ9バイトで wTotalLength を知る
        let mut header = [0u8; ConfigurationDescriptor::LENGTH];
        let len = self.get_configuration_descriptor(slot_id, &mut header)?;
        let config =
            ConfigurationDescriptor::from_bytes(&header[..len]).ok_or(UsbError::InvalidDescriptor)?;

        let total = (config.w_total_length as usize)
            .min(self.config.max_config_descriptor_len)
            .max(ConfigurationDescriptor::LENGTH);
        let mut buf = vec![0u8; total];
        let len = self.get_configuration_descriptor(slot_id, &mut buf)?;
        let configuration = parse_configuration(&buf[..len]).ok_or(UsbError::InvalidDescriptor)?;
        log_configuration(&configuration);

        let boot_keyboard = configuration.find_boot_keyboard().is_some();
        if boot_keyboard {
            info!("HID Boot Keyboard detected on port {}", port.one_indexed());
        }

        self.set_configuration(slot_id, configuration.config.b_configuration_value)?;

        Ok(EnumeratedDevice {
            port,
            slot_id,
            address,
            speed,
            device,
            configuration,
            boot_keyboard,
        })
    }

    /// 接続変化のあったポートをすべて列挙する
    ///
    /// ポートごとの失敗はログに残して次のポートへ進む。
    pub fn enumerate_connected_ports(&mut self) -> Vec<EnumeratedDevice> {
        let mut devices = Vec::new();
        for port in self.probe_ports() {
            if !port.connected || !port.connect_changed {
                continue;
            }
            self.clear_port_changes(port.port, PORTSC_CSC);
            if let Ok(device) = self.enumerate_device(port.port) {
                devices.push(device);
            }
        }
        devices
    }
}

fn log_configuration(configuration: &ParsedConfiguration) {
    let config = &configuration.config;
    debug!(
        "  Configuration {}: {} interface(s), total length {}",
        config.b_configuration_value, config.b_num_interfaces, config.w_total_length
    );
    for iface in &configuration.interfaces {
        let d = &iface.interface;
        debug!(
            "  Interface {}: class {:#04x}, subclass {:#04x}, protocol {:#04x}",
            d.b_interface_number, d.b_interface_class, d.b_interface_sub_class, d.b_interface_protocol
        );
        for ep in &iface.endpoints {
            debug!(
                "    Endpoint {:#04x}: {:?}, max packet {}, interval {}",
                ep.b_endpoint_address,
                ep.kind(),
                ep.max_packet_size(),
                ep.b_interval
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::dma::KernelHeapDma;

    #[test]
    fn test_table_indexing() {
        let table = DeviceTable::new();
        assert!(table.get(SlotId(0)).is_none());
        assert!(table.get(SlotId(1)).is_some());
        assert!(table.get(SlotId(255)).is_some());
        assert_eq!(table.in_use().count(), 0);
    }

    #[test]
    fn test_claim_and_release() {
        let dma = KernelHeapDma::new();
        let mut table = DeviceTable::new();
        table.claim(SlotId(3)).unwrap();
        assert_eq!(table.claim(SlotId(3)), Err(UsbError::InvalidParameter));

        let slot = table.get_mut(SlotId(3)).unwrap();
        assert_eq!(slot.slot_id, SlotId(3));
        slot.ep0_ring = Some(TransferRing::allocate(&dma, 16).unwrap());
        assert!(!slot.is_addressed());

        table.release(SlotId(3), &dma);
        let slot = table.get(SlotId(3)).unwrap();
        assert!(!slot.in_use);
        assert!(slot.ep0_ring().is_none());
    }

    #[test]
    fn test_claim_rejects_slot_zero() {
        let mut table = DeviceTable::new();
        assert_eq!(table.claim(SlotId::INVALID), Err(UsbError::InvalidParameter));
    }
}
