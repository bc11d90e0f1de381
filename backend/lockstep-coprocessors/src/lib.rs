//! Memory-mapped co-processors that sit on a host bus alongside the CPUs.

pub mod cop;
