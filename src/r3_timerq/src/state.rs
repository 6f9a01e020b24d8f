use crate::{error::BadContextError, PortScheduler, PortThreading};

/// If the current context is not a task context, return `Err(BadContext)`.
pub(crate) fn expect_task_context<Traits: PortThreading>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context is not waitable, return `Err(BadContext)`.
/// Otherwise, return the currently running task.
pub(crate) fn expect_waitable_context<Traits: PortScheduler>(
) -> Result<Traits::TaskId, BadContextError> {
    expect_task_context::<Traits>()?;
    Traits::current_task().ok_or(BadContextError::BadContext)
}
