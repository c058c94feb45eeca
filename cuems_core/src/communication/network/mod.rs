/// Network transports for CUEMS communication
///
/// - Endpoint parsing for `tcp://` and `ipc://` addresses
/// - Length-prefixed framing over byte streams
/// - Stream listeners/dialers for TCP and Unix domain sockets
/// - Bus-topology socket with pipe lifecycle events
/// - Dial retry with exponential backoff
pub mod bus;
pub mod endpoint;
pub mod framing;
pub mod reconnect;
pub mod stream;

pub use bus::{BusSocket, Frame, Pipe, PipeEvent, PipeId, SocketRole};
pub use endpoint::{check_ipc_path, parse_endpoint, Endpoint, IPC_SCHEME, TCP_SCHEME};
pub use framing::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use reconnect::ReconnectStrategy;
pub use stream::{dial, Connection, StreamListener};
