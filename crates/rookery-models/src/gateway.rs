// Local dispatch event names
pub const EVENT_ROOM_CREATE: &str = "ROOM_CREATE";
pub const EVENT_ROOM_UPDATE: &str = "ROOM_UPDATE";
pub const EVENT_ROOM_DELETE: &str = "ROOM_DELETE";
pub const EVENT_ROOM_MEMBER_ADD: &str = "ROOM_MEMBER_ADD";
pub const EVENT_ROOM_MEMBER_REMOVE: &str = "ROOM_MEMBER_REMOVE";
pub const EVENT_SYSTEM_MESSAGE_CREATE: &str = "SYSTEM_MESSAGE_CREATE";
