//! Client-side bridge element
//!
//! Forwards the request across the transport and continues the client
//! chain with the descriptor the endpoint returned. The local metadata map
//! is carried over, since it never crosses the wire.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::Transport;
use crate::chain::NetworkServiceElement;
use crate::connection::{Connection, Request};
use crate::context::RequestContext;
use crate::error::ChainError;

/// Transport bridge element
pub struct Connect {
    transport: Arc<dyn Transport>,
}

impl Connect {
    /// Create the element
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl NetworkServiceElement for Connect {
    fn name(&self) -> &str {
        "connect"
    }

    async fn request(&self, ctx: &RequestContext, request: &mut Request) -> Result<(), ChainError> {
        let metadata = request.connection.metadata.clone();
        let mut returned = self.transport.request(ctx, request.clone()).await?;
        returned.metadata = metadata;

        debug!(
            connection_id = %returned.id,
            mechanism = returned.mechanism_type().unwrap_or("-"),
            "endpoint response received"
        );
        request.connection = returned;
        Ok(())
    }

    async fn close(&self, ctx: &RequestContext, conn: &mut Connection) -> Result<(), ChainError> {
        self.transport.close(ctx, conn.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Mechanism;
    use crate::service::NetworkService;
    use crate::transport::LocalTransport;

    struct Completing;

    #[async_trait]
    impl NetworkService for Completing {
        async fn request(&self, _ctx: &RequestContext, request: Request) -> Result<Connection, ChainError> {
            let mut conn = request.connection;
            conn.mechanism = request.mechanism_preferences.into_iter().next();
            Ok(conn)
        }

        async fn close(&self, _ctx: &RequestContext, _conn: Connection) -> Result<(), ChainError> {
            Err(ChainError::Transport("endpoint gone".into()))
        }
    }

    #[tokio::test]
    async fn test_response_replaces_connection() {
        let connect = Connect::new(Arc::new(LocalTransport::new(Arc::new(Completing))));
        let ctx = RequestContext::background();

        let mut req =
            Request::new(Connection::new("conn-1", "ns")).with_preference(Mechanism::new("IPSEC"));
        req.connection.metadata.insert("client.if_index", &3u32).unwrap();

        connect.request(&ctx, &mut req).await.unwrap();
        assert_eq!(req.connection.mechanism_type(), Some("IPSEC"));
        assert_eq!(req.connection.metadata.get::<u32>("client.if_index"), Some(3));

        let result = connect.close(&ctx, &mut req.connection).await;
        assert!(matches!(result, Err(ChainError::Transport(_))));
    }
}
