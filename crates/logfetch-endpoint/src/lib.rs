//! logfetch-endpoint: remote log servers reached through OpenDAL

mod delete;
pub mod endpoint;
pub mod operator;
pub mod reachability;
pub mod registry;

pub use endpoint::{Endpoint, RemoteReader, Timeouts};
pub use operator::{build_ftp_operator, EndpointAddr, OperatorFactory};
pub use reachability::{check_reachable, is_reachable};
pub use registry::{offset_ipv4_host, EndpointRegistry};
