//! Path maintenance
//!
//! Each chain owns one segment of the connection path. On request the
//! element makes sure the segment after the current index belongs to this
//! chain (appending it on first sight), stamps it with a fresh token and
//! moves the index onto it.

use async_trait::async_trait;
use tracing::trace;

use crate::chain::NetworkServiceElement;
use crate::connection::{Connection, PathSegment, Request};
use crate::context::RequestContext;
use crate::error::ChainError;
use crate::token::SharedTokenGenerator;

/// Path segment element
pub struct UpdatePath {
    name: String,
    token_generator: SharedTokenGenerator,
}

impl UpdatePath {
    /// Element stamping segments named `name`
    pub fn new(name: impl Into<String>, token_generator: SharedTokenGenerator) -> Self {
        Self {
            name: name.into(),
            token_generator,
        }
    }
}

#[async_trait]
impl NetworkServiceElement for UpdatePath {
    fn name(&self) -> &str {
        "update_path"
    }

    async fn request(&self, _ctx: &RequestContext, request: &mut Request) -> Result<(), ChainError> {
        let conn = &mut request.connection;
        let path = &mut conn.path;
        if !path.segments.is_empty() && path.index >= path.segments.len() {
            return Err(ChainError::InvalidRequest(format!(
                "path index {} out of range for {} segments",
                path.index,
                path.segments.len()
            )));
        }
        let token = self.token_generator.generate()?;

        // Own segment is either the current one (first hop) or the next one
        let position = if path.segments.is_empty() {
            None
        } else if path.current().is_some_and(|s| s.name == self.name) {
            Some(path.index)
        } else {
            Some(path.index + 1)
        };

        let index = match position {
            Some(i) if i < path.segments.len() && path.segments[i].name == self.name => i,
            Some(i) => {
                path.segments.truncate(i);
                path.segments.push(PathSegment {
                    name: self.name.clone(),
                    id: conn.id.clone(),
                    token: String::new(),
                    expires: token.expires,
                });
                i
            }
            None => {
                path.segments.push(PathSegment {
                    name: self.name.clone(),
                    id: conn.id.clone(),
                    token: String::new(),
                    expires: token.expires,
                });
                0
            }
        };

        let segment = &mut path.segments[index];
        segment.token = token.value;
        segment.expires = token.expires;
        path.index = index;

        trace!(name = %self.name, index, connection_id = %conn.id, "path segment updated");
        Ok(())
    }

    async fn close(&self, _ctx: &RequestContext, _conn: &mut Connection) -> Result<(), ChainError> {
        Ok(())
    }
}
