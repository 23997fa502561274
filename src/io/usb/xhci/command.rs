// ============================================================================
// src/io/usb/xhci/command.rs - xHCI Command Execution
// ============================================================================
//!
//! コマンドの発行と完了待ち。
//!
//! コマンドTRBの物理アドレスが完了イベントの Parameter に返ってくるので、
//! それをキーにして自分のコマンドの完了だけを取り出す。

use log::{debug, info, warn};

use super::controller::{XhciController, pump_event};
use super::event_handler::CommandCompletion;
use super::registers::{RegisterIo, op};
use super::trb::{CompletionCode, Trb, TrbType};
use super::wait::{WaitPolicy, WaitStage, poll_until};
use crate::io::dma::DmaAllocator;
use crate::io::usb::{SlotId, UsbError, UsbResult};

impl<R: RegisterIo, A: DmaAllocator, W: WaitPolicy> XhciController<R, A, W> {
    /// コマンドTRBアドレスに対応する完了イベントを待つ
    pub fn wait_for_command(&mut self, command_trb: u64) -> UsbResult<CommandCompletion> {
        let regs = &self.regs;
        let memory = &mut self.memory;
        let events = &mut self.events;
        let mut completion = None;

        let done = poll_until(&self.wait, || {
            while pump_event(regs, memory, events) {}
            completion = events.take_completion(command_trb);
            completion.is_some()
        });

        match completion {
            Some(completion) if done => Ok(completion),
            _ => {
                self.events.forget(command_trb);
                let last = self.regs.read_op32(op::USBSTS);
                warn!(
                    "xHCI: no completion for command TRB {:#x} (USBSTS {:#010x})",
                    command_trb, last
                );
                Err(UsbError::Timeout {
                    stage: WaitStage::CommandCompletion,
                    last,
                })
            }
        }
    }

    /// コマンドを発行して完了を待ち、Success 以外はエラーにする
    pub fn execute_command(&mut self, trb: Trb) -> UsbResult<CommandCompletion> {
        let command = TrbType::from_u8(trb.trb_type()).ok_or(UsbError::InvalidParameter)?;
        let address = self.post_command(trb)?;
        let completion = self.wait_for_command(address)?;
        if completion.code != CompletionCode::Success {
            warn!("xHCI: {:?} command failed: {:?}", command, completion.code);
            return Err(UsbError::CommandFailed {
                command,
                code: completion.code,
            });
        }
        Ok(completion)
    }

    /// No-Op コマンド（コマンドリングの疎通確認）
    pub fn noop_command(&mut self) -> UsbResult<()> {
        self.execute_command(Trb::noop_command())?;
        debug!("xHCI: No-Op command completed");
        Ok(())
    }

    /// デバイススロットを有効化
    pub fn enable_slot(&mut self) -> UsbResult<SlotId> {
        let completion = self.execute_command(Trb::enable_slot())?;
        let slot_id = completion.slot_id;
        if !slot_id.is_valid() || slot_id.as_u8() > self.capabilities().max_slots {
            warn!("xHCI: Enable Slot returned invalid slot {}", slot_id);
            return Err(UsbError::InvalidParameter);
        }

        self.devices.claim(slot_id)?;
        info!("xHCI: enabled slot {}", slot_id);
        Ok(slot_id)
    }

    /// デバイススロットを無効化し、スロットの資源を返却
    pub fn disable_slot(&mut self, slot_id: SlotId) -> UsbResult<()> {
        if !self.devices.get(slot_id).is_some_and(|slot| slot.in_use) {
            return Err(UsbError::DeviceNotFound);
        }
        self.execute_command(Trb::disable_slot(slot_id))?;

        if let Some(memory) = self.memory.as_mut() {
            memory.dcbaa.clear(slot_id);
        }
        self.devices.release(slot_id, &self.dma);
        info!("xHCI: disabled slot {}", slot_id);
        Ok(())
    }
}
