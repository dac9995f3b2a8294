pub mod behavior;
pub mod config;
pub mod module;
pub mod regs;
