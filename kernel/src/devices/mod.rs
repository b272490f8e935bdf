//! Hardware devices used by the kernel.

pub mod serial;
