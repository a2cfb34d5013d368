pub mod assigner;
pub mod job;
pub mod range;
pub mod tree;

pub use assigner::{check_allocation, Assignment, Scheduler, Transition};
pub use job::{Allocation, ClientStatus, Job, Purpose, Status, Task};
pub use range::FrameRange;
pub use tree::{AllocationPicker, JobTree, Pick};
