//! The two dispatch back-ends, modeled as a closed enum over zero-sized
//! marker types rather than a boxed `dyn DispatchOps`. There are exactly
//! two implementations and they never change at runtime for a given device,
//! so a `match` avoids a vtable indirection and an allocation per device.

pub mod ert;
pub mod software;

use crate::command::Command;
use crate::error::ExecCoreError;
use crate::exec_core::ExecCore;

/// Outcome of a completion probe (`ops.query`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Running,
    Completed,
}

/// `{submit, query}`, implemented once per back-end.
pub trait DispatchOps {
    fn submit(exec: &mut ExecCore, cmd: &mut Command) -> Result<(), ExecCoreError>;
    fn query(exec: &mut ExecCore, cmd: &mut Command) -> Result<QueryOutcome, ExecCoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchBackend {
    Software,
    Ert,
}

impl DispatchBackend {
    pub fn submit(self, exec: &mut ExecCore, cmd: &mut Command) -> Result<(), ExecCoreError> {
        match self {
            DispatchBackend::Software => software::Software::submit(exec, cmd),
            DispatchBackend::Ert => ert::Ert::submit(exec, cmd),
        }
    }

    pub fn query(self, exec: &mut ExecCore, cmd: &mut Command) -> Result<QueryOutcome, ExecCoreError> {
        match self {
            DispatchBackend::Software => software::Software::query(exec, cmd),
            DispatchBackend::Ert => ert::Ert::query(exec, cmd),
        }
    }
}
