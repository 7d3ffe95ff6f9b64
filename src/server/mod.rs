//! Member-side endpoints for tests, demos and the `serve` command

pub mod in_process;
pub mod member;
pub mod tcp;

pub use in_process::InProcessNetwork;
pub use member::{EchoHandler, MemberServer, RequestHandler};
pub use tcp::TcpMemberServer;
