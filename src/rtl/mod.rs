//! Low-level runtime primitives: bit scanning and the Bitmap Pool (C1)
//! built on top of it.

pub mod bitmap;
pub mod bitmap_pool;
