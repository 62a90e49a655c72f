mod connection;
mod error;
mod listener;

pub use connection::{
    ClientConnection, MockClientConnection, MockConnectionHandle, ReadOutcome, TcpClientConnection,
};
pub use error::NetError;
pub use listener::ClientListener;
