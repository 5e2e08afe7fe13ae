// # Synchronization Primitives
//
// The two building blocks every layer above leans on: a logical
// reference counter that gates teardown, and a reason-coded wait queue
// that parks a thread while releasing a caller-held mutex.

pub mod refcount;
pub mod wait_queue;

pub use refcount::RefCount;
pub use wait_queue::{WaitQueue, WakeReason};
