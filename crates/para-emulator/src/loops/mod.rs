//! Background loops for continuous processing.

pub mod device_loop;
