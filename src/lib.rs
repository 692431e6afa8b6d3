pub mod channel;
pub mod chunk;
pub mod consts;
pub mod diagnostics;
pub mod error;
pub mod probe;
pub mod request;
pub mod socket;
pub mod tester;
pub mod transport;

pub use channel::{
    Channel, ChannelConfig, ChannelHandle, ChannelState, ConnectOptions, Handler, OutgoingMap,
    QueuedMap,
};
pub use error::{BcError, ErrorCode, RequestError, Result};
pub use socket::{BcSocket, SocketHandler, SocketOptions};
pub use tester::TestResults;
