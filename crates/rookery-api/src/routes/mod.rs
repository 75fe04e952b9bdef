pub mod federation;
pub mod members;
pub mod realtime;
pub mod rooms;
pub mod users;
