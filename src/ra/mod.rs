pub mod command;
pub mod device;
pub mod frame;
pub mod system;
pub mod timeline;
