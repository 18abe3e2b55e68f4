mod codec;
mod messages;

pub use codec::{
    ProtocolError, ACTION_HEADER, FORWARDED_BY_HEADER, FORWARDED_FOR_HEADER,
    FORWARDED_HOST_HEADER, PROTOCOL_HEADER, REMOTE_ADDR_HEADER, URL_PATH_HEADER,
};
pub use messages::{Action, ControlMessage, Protocol};
