pub mod config;
pub mod hw;
pub mod top;
pub mod traffic;
