pub mod access;
pub mod collect;
pub mod hosted;
pub mod proxy;
pub mod verify;
