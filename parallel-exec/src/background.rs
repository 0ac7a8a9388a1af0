//! Fire-and-forget task handle: no pipes are retained, only the PID and a
//! status-file reference. Observation happens entirely through the status
//! store; this type only supports termination and liveness checks.

use crate::error::ExecResult;
use crate::handle::ProcessHandle;
use crate::id::TaskId;

pub struct BackgroundProcess {
    handle: ProcessHandle,
}

impl BackgroundProcess {
    pub(crate) fn from_handle(handle: ProcessHandle) -> Self {
        BackgroundProcess { handle }
    }

    pub fn task_id(&self) -> &TaskId {
        self.handle.task_id()
    }

    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn terminate(&self) -> ExecResult<()> {
        self.handle.terminate()
    }
}
