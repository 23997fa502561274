// ============================================================================
// src/io/usb/xhci/transfer.rs - Control Transfers on EP0
// ============================================================================
//!
//! コントロール転送 (Setup / Data / Status ステージ)。
//!
//! データステージは DMA バウンスバッファを経由する。完了は積んだ TRB の
//! 物理アドレスを指す Transfer Event で確認し、Status TRB の完了で終わる。
//! 短い IN 転送の残りバイト数は Data TRB の Short Packet イベントから取る。

use log::{debug, info, warn};

use super::controller::{XhciController, pump_event};
use super::event_handler::EventDispatcher;
use super::registers::{DoorbellTarget, RegisterIo};
use super::trb::{CompletionCode, Trb};
use super::wait::{WaitPolicy, WaitStage, poll_until};
use crate::io::dma::{DmaAllocator, DmaBuffer, MIN_DMA_ALIGNMENT};
use crate::io::usb::descriptor::{DescriptorType, DeviceDescriptor, FromDescriptorBytes};
use crate::io::usb::{SetupPacket, SlotId, UsbError, UsbResult};

impl<R: RegisterIo, A: DmaAllocator, W: WaitPolicy> XhciController<R, A, W> {
    /// EP0 でコントロール転送を実行し、データステージの転送バイト数を返す
    ///
    /// `wLength > 0` のときは `data` が `wLength` 以上の長さを持つ必要がある。
    pub fn control_transfer(
        &mut self,
        slot_id: SlotId,
        setup: SetupPacket,
        data: Option<&mut [u8]>,
    ) -> UsbResult<usize> {
        if !self.is_running() {
            return Err(UsbError::NotRunning);
        }
        let has_ring = self
            .devices
            .get(slot_id)
            .is_some_and(|slot| slot.in_use && slot.ep0_ring.is_some());
        if !has_ring {
            return Err(UsbError::DeviceNotFound);
        }

        let length = setup.w_length as usize;
        let dir_in = setup.is_device_to_host();
        let mut data = if length > 0 {
            match data {
                Some(buf) if buf.len() >= length => Some(buf),
                _ => return Err(UsbError::BufferSize),
            }
        } else {
            None
        };

        let mut bounce = match data.as_deref() {
            Some(buf) => {
                let mut bounce = self.dma.allocate(length, MIN_DMA_ALIGNMENT)?;
                if !dir_in {
                    bounce.copy_from_slice(0, &buf[..length]);
                }
                Some(bounce)
            }
            None => None,
        };

        let result = self.run_control_stages(slot_id, &setup, bounce.as_ref());

        if let (Ok(transferred), Some(bounce), Some(buf)) = (&result, bounce.as_ref(), data.as_deref_mut()) {
            if dir_in {
                bounce.copy_to_slice(0, &mut buf[..*transferred]);
            }
        }
        if let Some(bounce) = bounce.take() {
            if matches!(result, Err(UsbError::Timeout { .. })) {
                // Data TRB がまだこのバッファを指しているので返却しない
                warn!(
                    "xHCI: keeping bounce buffer {:#x} of timed-out transfer on slot {}",
                    bounce.phys_addr(),
                    slot_id
                );
            } else {
                self.dma.release(bounce);
            }
        }
        result
    }

    /// TRB を積んでドアベルを鳴らし、転送イベントを待つ
    fn run_control_stages(
        &mut self,
        slot_id: SlotId,
        setup: &SetupPacket,
        bounce: Option<&DmaBuffer>,
    ) -> UsbResult<usize> {
        let length = setup.w_length as usize;
        let dir_in = setup.is_device_to_host();

        let stages = {
            let ring = self
                .devices
                .get_mut(slot_id)
                .and_then(|slot| slot.ep0_ring.as_mut())
                .ok_or(UsbError::DeviceNotFound)?;

            let setup_trb = ring.enqueue(Trb::setup_stage(setup));
            let data_trb = bounce
                .map(|buffer| ring.enqueue(Trb::data_stage(buffer.phys_addr(), length as u32, dir_in)));
            let status_in = data_trb.is_none() || !dir_in;
            let status_trb = ring.enqueue(Trb::status_stage(status_in));
            ControlStages {
                setup: setup_trb,
                data: data_trb,
                status: status_trb,
            }
        };
        for address in stages.addresses() {
            self.events.expect(address);
        }
        self.ring_doorbell(slot_id, DoorbellTarget::CONTROL_EP0);

        let regs = &self.regs;
        let memory = &mut self.memory;
        let events = &mut self.events;
        let mut outcome = ControlOutcome::default();
        poll_until(&self.wait, || {
            while pump_event(regs, memory, events) {}
            outcome.collect(events, &stages);
            outcome.is_finished()
        });
        for address in stages.addresses() {
            self.events.forget(address);
        }

        if let Some(code) = outcome.failure {
            return match code {
                CompletionCode::StallError => {
                    warn!("xHCI: slot {} EP0 stalled", slot_id);
                    Err(UsbError::Stalled)
                }
                code => {
                    warn!("xHCI: control transfer on slot {} failed: {:?}", slot_id, code);
                    Err(UsbError::TransferError(code.to_transfer_status()))
                }
            };
        }
        if outcome.status.is_none() {
            warn!("xHCI: control transfer on slot {} timed out", slot_id);
            return Err(UsbError::Timeout {
                stage: WaitStage::TransferCompletion,
                last: 0,
            });
        }

        let transferred = length.saturating_sub(outcome.residual as usize);
        debug!(
            "xHCI: control transfer on slot {}: {} of {} bytes",
            slot_id, transferred, length
        );
        Ok(transferred)
    }

    /// デバイスディスクリプタ (18バイト) を取得
    pub fn get_device_descriptor(&mut self, slot_id: SlotId) -> UsbResult<DeviceDescriptor> {
        let mut buf = [0u8; DeviceDescriptor::LENGTH];
        let setup = SetupPacket::get_descriptor(
            DescriptorType::Device as u8,
            0,
            DeviceDescriptor::LENGTH as u16,
        );
        let len = self.control_transfer(slot_id, setup, Some(&mut buf))?;
        let desc = DeviceDescriptor::from_bytes(&buf[..len]).ok_or(UsbError::InvalidDescriptor)?;

        let (major, minor) = desc.usb_version();
        info!(
            "  USB {:x}.{:02x}, class {:#04x}, vendor {:04x}, product {:04x}, EP0 max packet {}, {} configuration(s)",
            major,
            minor,
            desc.b_device_class,
            desc.id_vendor,
            desc.id_product,
            desc.b_max_packet_size0,
            desc.b_num_configurations
        );
        Ok(desc)
    }

    /// コンフィグレーションディスクリプタを `buf.len()` バイトまで取得
    pub fn get_configuration_descriptor(
        &mut self,
        slot_id: SlotId,
        buf: &mut [u8],
    ) -> UsbResult<usize> {
        let length = u16::try_from(buf.len()).map_err(|_| UsbError::BufferSize)?;
        let setup =
            SetupPacket::get_descriptor(DescriptorType::Configuration as u8, 0, length);
        self.control_transfer(slot_id, setup, Some(buf))
    }

    /// SET_CONFIGURATION（データステージなし）
    pub fn set_configuration(&mut self, slot_id: SlotId, value: u8) -> UsbResult<()> {
        self.control_transfer(slot_id, SetupPacket::set_configuration(value), None)?;
        info!("xHCI: slot {} configuration {} set", slot_id, value);
        Ok(())
    }
}

// ============================================================================
// Stage Tracking
// ============================================================================

/// 1回のコントロール転送で積んだ TRB の物理アドレス
#[derive(Debug, Clone, Copy)]
struct ControlStages {
    setup: u64,
    data: Option<u64>,
    status: u64,
}

impl ControlStages {
    fn addresses(&self) -> impl Iterator<Item = u64> {
        [Some(self.setup), self.data, Some(self.status)]
            .into_iter()
            .flatten()
    }
}

/// 届いた転送イベントの集計
///
/// Short Packet は Data TRB を指して届き、その後 Status TRB の完了が続く。
/// エラーはどのステージの TRB を指していても転送を終わらせる。
#[derive(Debug, Default)]
struct ControlOutcome {
    residual: u32,
    status: Option<CompletionCode>,
    failure: Option<CompletionCode>,
}

impl ControlOutcome {
    fn collect(&mut self, events: &mut EventDispatcher, stages: &ControlStages) {
        for address in stages.addresses() {
            let Some(event) = events.take_transfer(address) else {
                continue;
            };
            if !event.code.is_success() {
                self.failure.get_or_insert(event.code);
            } else if address == stages.status {
                self.status = Some(event.code);
            } else if Some(address) == stages.data {
                self.residual = event.residual;
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.failure.is_some() || self.status.is_some()
    }
}
