pub mod events;
pub mod ids;
pub mod machine;
pub mod protocol;
pub mod task;

pub use ids::{IdentityId, SubtaskId, TaskId};
pub use machine::{MachineId, MachineRecord, SystemInfo};
pub use task::{Attempt, Subtask, SubtaskStatus, Task, TaskStatus, Validation};
