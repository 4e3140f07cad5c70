//! Reachability check run whenever an endpoint connects

use logfetch_core::{LogFetchError, LogFetchResult};
use opendal::Operator;

use crate::operator::EndpointAddr;

/// The log server behind `op` answers a listing of its root. A server with no
/// log folders yet still answers, with an empty listing.
pub async fn check_reachable(op: &Operator, addr: &EndpointAddr) -> LogFetchResult<()> {
    op.list("/").await.map(|_| ()).map_err(|e| LogFetchError::Connection {
        endpoint: addr.to_string(),
        reason: format!("log server did not answer a root listing: {e}"),
    })
}

pub async fn is_reachable(op: &Operator, addr: &EndpointAddr) -> bool {
    check_reachable(op, addr).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::build_ftp_operator;

    #[test]
    fn empty_log_server_is_reachable() {
        let op = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        let addr = EndpointAddr::new("main", "127.0.0.1", 30021);
        assert!(tokio_test::block_on(is_reachable(&op, &addr)));
    }

    #[tokio::test]
    async fn closed_port_is_a_connection_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let addr = EndpointAddr::new("cam", "127.0.0.1", port);
        let op = build_ftp_operator(&addr).unwrap();

        let err = check_reachable(&op, &addr).await.unwrap_err();
        assert!(err.is_connection());
        assert!(err.to_string().contains("cam@127.0.0.1"));
    }
}
