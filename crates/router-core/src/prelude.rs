pub use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
pub use std::sync::Arc;

pub use arcstr::ArcStr as Strng;
pub use bytes::Bytes;
pub use tracing::{debug, error, info, trace, warn};
