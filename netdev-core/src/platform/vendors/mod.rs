//! Built-in vendor handlers.

mod cisco;
pub mod cisco_ios;
pub mod cisco_iosxe;
pub mod cisco_nxos;
pub mod juniper;

pub use cisco_ios::CiscoIosHandler;
pub use cisco_iosxe::CiscoIosXeHandler;
pub use cisco_nxos::CiscoNxosHandler;
pub use juniper::JuniperHandler;
