//! Supervises OCI container processes that are launched through an external runtime
//! binary (`runc` or compatible) by a small per-process shim.
//!
//! The supervisor can be restarted at any time: everything it needs to find its
//! processes again lives in the state directory, and the shims keep the processes
//! running in the meantime.

pub mod sandbox;

pub mod sys;
