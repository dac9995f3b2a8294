pub mod base;
pub mod pm;
pub mod registry;
pub mod rpmh;
pub mod rsc;
pub mod sim;
pub mod ui;

#[cfg(test)]
mod tests;
