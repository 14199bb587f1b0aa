pub mod device;
pub mod kgd;
pub mod regs;
pub mod sim;
