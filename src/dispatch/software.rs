//! Software ("penguin") dispatch: the host picks a free CU, writes its
//! regmap directly, and polls `AP_DONE` instead of waiting on ERT firmware.

use log::trace;

use crate::command::Command;
use crate::error::ExecCoreError;
use crate::exec_core::ExecCore;
use crate::limits::AP_START;
use crate::packet::{Opcode, PacketType};

use super::{DispatchOps, QueryOutcome};

pub struct Software;

impl DispatchOps for Software {
    fn submit(exec: &mut ExecCore, cmd: &mut Command) -> Result<(), ExecCoreError> {
        if cmd.opcode == Opcode::Configure || cmd.packet_type == PacketType::KdsLocal {
            let slot = exec.slots.acquire(exec.num_slot_masks, exec.num_slots).ok_or(ExecCoreError::BackendBusy)?;
            cmd.slot = Some(slot);
            exec.submitted_cmds[slot] = Some(cmd.id);
            return Ok(());
        }

        if cmd.opcode != Opcode::StartCu {
            return Err(ExecCoreError::BadPacket);
        }

        let cu = find_free_cu(exec, cmd).ok_or(ExecCoreError::BackendBusy)?;
        let slot = match exec.slots.acquire(exec.num_slot_masks, exec.num_slots) {
            Some(slot) => slot,
            None => {
                exec.cus.release(cu);
                return Err(ExecCoreError::BackendBusy);
            }
        };

        cmd.cu = Some(cu);
        cmd.slot = Some(slot);
        exec.submitted_cmds[slot] = Some(cmd.id);
        configure_cu(exec, cmd, cu);
        trace!("cmd {} started on cu {} slot {}", cmd.id.get(), cu, slot);
        Ok(())
    }

    fn query(exec: &mut ExecCore, cmd: &mut Command) -> Result<QueryOutcome, ExecCoreError> {
        if cmd.packet_type == PacketType::KdsLocal || cmd.opcode == Opcode::Configure {
            return Ok(QueryOutcome::Completed);
        }
        if cmd.opcode != Opcode::StartCu {
            return Ok(QueryOutcome::Running);
        }

        let cu = cmd.cu.expect("running START_CU command has no cu assigned");
        let cu_addr = exec.cu_addr_map[cu];
        let done = unsafe { exec.mmio.read32(cu_addr) } & crate::limits::AP_DONE != 0;
        if done {
            exec.cus.release(cu);
            Ok(QueryOutcome::Completed)
        } else {
            Ok(QueryOutcome::Running)
        }
    }
}

/// Scans the command's CU-mask words against the busy bitmap, one mask
/// word at a time.
fn find_free_cu(exec: &mut ExecCore, cmd: &Command) -> Option<usize> {
    for (mask_idx, candidate_mask) in cmd.view().cu_mask_words().iter().enumerate() {
        if let Some(cu) = exec.cus.acquire_from_candidates(mask_idx, *candidate_mask) {
            return Some(cu);
        }
    }
    None
}

/// Writes the regmap into the CU's register file, deliberately skipping
/// word 0 (reserved for `AP_START`) and writing the start bit last so the
/// regmap writes happen-before the CU observes `AP_START`.
fn configure_cu(exec: &mut ExecCore, cmd: &Command, cu: usize) {
    let base = exec.cu_addr_map[cu];
    let regmap = cmd.view().regmap();
    for (i, word) in regmap.iter().enumerate().skip(1) {
        unsafe { exec.mmio.write32(base + 4 * i, *word) };
    }
    unsafe { exec.mmio.write32(base, AP_START) };
}
