// callboard-common: wire protocol and shared types for the presence and
// call-signaling channel.

pub mod protocol;
pub mod types;
