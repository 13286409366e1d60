//! Sandbox filesystem mapping for launched tasks.
//!
//! The agent does not expose the container-id to task-id mapping for nested
//! containers, so operators and the UI reach a task's sandbox through a
//! symlink the executor creates: `<sandbox>/tasks/<taskId>` points at
//! `<sandbox>/containers/<containerId>`. The executor runs with its sandbox
//! as working directory, so the links sit beside the container sandboxes.

use std::io;
use std::path::Path;

use tracing::debug;

use mesos_proto::{ContainerId, TaskId};

const TASKS_DIRECTORY: &str = "tasks";
const CONTAINERS_DIRECTORY: &str = "containers";

/// Creates the `tasks/` directory (if needed) and the per-task symlink into
/// the child container's sandbox.
pub fn link_task_sandbox(
    sandbox_directory: &Path,
    task_id: &TaskId,
    container_id: &ContainerId,
) -> io::Result<()> {
    let tasks_dir = sandbox_directory.join(TASKS_DIRECTORY);
    std::fs::create_dir_all(&tasks_dir)?;

    let target = sandbox_directory
        .join(CONTAINERS_DIRECTORY)
        .join(&container_id.value);
    let link = tasks_dir.join(task_id.as_str());

    std::os::unix::fs::symlink(&target, &link)?;

    debug!(
        task_id = %task_id,
        target = %target.display(),
        "Created task sandbox symlink"
    );

    Ok(())
}
