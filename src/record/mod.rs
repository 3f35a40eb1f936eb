pub mod tracked;
pub mod list;
pub mod freeze;
