//! ERT dispatch: write the whole packet into a CQ slot and let the embedded
//! firmware drive the CU, reporting completion through status registers
//! instead of the host polling `AP_DONE` itself.

use log::trace;

use crate::command::Command;
use crate::error::ExecCoreError;
use crate::exec_core::ExecCore;
use crate::limits::{CQ_BASE, CQ_STATUS_REG};
use crate::packet::PacketType;

use super::{DispatchOps, QueryOutcome};

pub struct Ert;

impl DispatchOps for Ert {
    fn submit(exec: &mut ExecCore, cmd: &mut Command) -> Result<(), ExecCoreError> {
        let slot = exec.slots.acquire(exec.num_slot_masks, exec.num_slots).ok_or(ExecCoreError::BackendBusy)?;
        cmd.slot = Some(slot);
        exec.submitted_cmds[slot] = Some(cmd.id);

        if cmd.packet_type == PacketType::KdsLocal {
            return Ok(());
        }

        let slot_addr = CQ_BASE + slot * exec.slot_size;
        let words = cmd.view().raw_words();
        unsafe { exec.mmio.write32_bulk(slot_addr + 4, &words[1..]) };
        // The header write is the commit: ERT must not observe a partially
        // written slot body.
        unsafe { exec.mmio.write32(slot_addr, words[0]) };

        if exec.cq_interrupt {
            let mask_idx = slot / 32;
            let bit = 1u32 << (slot % 32);
            unsafe { exec.mmio.write32(CQ_STATUS_REG + (mask_idx << 2), bit) };
        }

        trace!("cmd {} submitted to ert slot {}", cmd.id.get(), slot);
        Ok(())
    }

    fn query(exec: &mut ExecCore, cmd: &mut Command) -> Result<QueryOutcome, ExecCoreError> {
        if cmd.packet_type == PacketType::KdsLocal {
            return Ok(QueryOutcome::Completed);
        }

        let slot = cmd.slot.expect("running ert command has no slot assigned");
        let mask_idx = slot / 32;
        let bits = match exec.ert_status_bits(mask_idx) {
            Some(bits) => bits,
            None => return Ok(QueryOutcome::Running),
        };

        let bit_set = (bits >> (slot % 32)) & 1 != 0;
        Ok(if bit_set { QueryOutcome::Completed } else { QueryOutcome::Running })
    }
}
