pub mod fifo;
pub mod liveness;
pub mod pidfd;
pub mod reaper;
pub mod shim;
