pub mod capabilities;
pub mod event;
pub mod gateway;
pub mod identity;
pub mod membership;
pub mod permissions;
pub mod room;
pub mod system_message;
