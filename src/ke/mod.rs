//! Kernel-environment primitives shared across the other subsystems:
//! the intrusive list used for page/block linkage, and the critical
//! section that serializes every pool's mutating operations.

pub mod list;
pub mod sync;
