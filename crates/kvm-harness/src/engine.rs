//! Execution engine: enters the guest and demultiplexes VM exits.
//!
//! ```text
//! Running --hlt / completion port--> Completed
//! Running --interrupted-----------> Running
//! Running --anything else---------> Aborted (ExecutionFault)
//! ```
//!
//! There is no timeout here. `KVM_RUN` blocks until the guest exits; a
//! watchdog outside the harness has to deliver a signal to break it.

use crate::{
    error::{HarnessError, Result},
    instance::VmInstance,
    result::ResultRecord,
    traits::{VcpuHandle, VmHandle},
    types::VcpuExit,
};

/// What the engine does with a VM exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// The guest signalled completion; read the Result Record.
    Complete,
    /// Re-enter the guest without touching its state.
    Retry,
    /// Abort the run.
    Fault,
}

/// Classifies an exit. `completion_port` is the I/O port whose writes count
/// as completion, if any.
#[must_use]
pub fn classify(exit: &VcpuExit, completion_port: Option<u16>) -> ExitAction {
    match exit {
        VcpuExit::Halt => ExitAction::Complete,
        VcpuExit::IoOut { port, .. } if Some(*port) == completion_port => ExitAction::Complete,
        VcpuExit::Interrupted => ExitAction::Retry,
        _ => ExitAction::Fault,
    }
}

fn guest_rip<C: VcpuHandle + ?Sized>(vcpu: &C) -> Option<u64> {
    vcpu.get_regs().ok().map(|regs| regs.rip)
}

/// Runs the guest until its next completion exit and returns the record it
/// left behind.
///
/// The record is reset to "no result" before the guest is entered, so a
/// guest that halts without writing one yields `KVM_TNONE`.
pub fn run_instance<V: VmHandle>(instance: &mut VmInstance<V>) -> Result<ResultRecord> {
    instance.reset_result()?;
    let completion_port = instance.config().completion_port;

    loop {
        let vcpu = instance.vcpu_mut()?;
        let exit = match vcpu.run() {
            Ok(exit) => exit,
            Err(e) => {
                return Err(HarnessError::fault(
                    format!("KVM_RUN failed: {e}"),
                    guest_rip(&*vcpu),
                ));
            }
        };

        tracing::trace!("vCPU exit: {:?}", exit);

        match classify(&exit, completion_port) {
            ExitAction::Complete => break,
            ExitAction::Retry => {
                tracing::trace!("KVM_RUN interrupted, re-entering guest");
            }
            ExitAction::Fault => {
                let rip = guest_rip(&*vcpu);
                tracing::error!("Unexpected VM exit {:?}", exit);
                return Err(HarnessError::fault(
                    format!("unexpected {} exit", exit.name()),
                    rip,
                ));
            }
        }
    }

    instance.read_result()
}
