//! Underlay firewall openings
//!
//! Opens the pinholes the mechanism element listed in the connection
//! metadata. Connections to the same peer share pinholes, so each opening
//! is reference counted by connection id and removed with its last holder.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::Side;
use crate::chain::NetworkServiceElement;
use crate::connection::{Connection, Request};
use crate::context::RequestContext;
use crate::dataplane::{Dataplane, Pinhole};
use crate::error::ChainError;

/// Pinhole element
pub struct PinholeElement {
    name: &'static str,
    side: Side,
    dataplane: Arc<dyn Dataplane>,
    // Held across dataplane calls: open and close of a shared pinhole
    // must not interleave.
    holders: tokio::sync::Mutex<HashMap<Pinhole, HashSet<String>>>,
    opened: Mutex<HashMap<String, Vec<Pinhole>>>,
}

impl PinholeElement {
    /// Element for one side of the tunnel
    pub fn new(dataplane: Arc<dyn Dataplane>, side: Side) -> Self {
        let name = match side {
            Side::Client => "pinhole-client",
            Side::Server => "pinhole-server",
        };
        Self {
            name,
            side,
            dataplane,
            holders: tokio::sync::Mutex::new(HashMap::new()),
            opened: Mutex::new(HashMap::new()),
        }
    }

    /// Number of open pinholes
    pub async fn open_count(&self) -> usize {
        self.holders.lock().await.len()
    }
}

#[async_trait]
impl NetworkServiceElement for PinholeElement {
    fn name(&self) -> &str {
        self.name
    }

    async fn request(&self, _ctx: &RequestContext, request: &mut Request) -> Result<(), ChainError> {
        let conn = &request.connection;
        let wanted = conn
            .metadata
            .get::<Vec<Pinhole>>(self.side.pinholes_key())
            .unwrap_or_default();

        let mut holders = self.holders.lock().await;
        for pinhole in &wanted {
            if holders.get(pinhole).is_some_and(|ids| ids.contains(&conn.id)) {
                continue;
            }
            if !holders.contains_key(pinhole) {
                self.dataplane
                    .add_pinhole(*pinhole)
                    .await
                    .map_err(|e| ChainError::dataplane(self.name, conn.id.clone(), e))?;
                info!(element = self.name, %pinhole, "pinhole opened");
            }
            holders.entry(*pinhole).or_default().insert(conn.id.clone());
            self.opened
                .lock()
                .entry(conn.id.clone())
                .or_default()
                .push(*pinhole);
        }
        Ok(())
    }

    async fn close(&self, _ctx: &RequestContext, conn: &mut Connection) -> Result<(), ChainError> {
        let mut holders = self.holders.lock().await;
        let Some(pinholes) = self.opened.lock().get(&conn.id).cloned() else {
            return Ok(());
        };

        // Pinholes whose delete failed stay held by this id for a retry
        let mut kept = Vec::new();
        let mut first_error = None;
        for pinhole in pinholes {
            let Some(ids) = holders.get_mut(&pinhole) else {
                continue;
            };
            if ids.len() > 1 || !ids.contains(&conn.id) {
                ids.remove(&conn.id);
                debug!(element = self.name, %pinhole, holders = ids.len(), "pinhole still in use");
                continue;
            }
            match self.dataplane.del_pinhole(pinhole).await {
                Ok(()) => {
                    holders.remove(&pinhole);
                    debug!(element = self.name, %pinhole, "pinhole closed");
                }
                Err(e) => {
                    warn!(element = self.name, %pinhole, error = %e, "pinhole not closed");
                    kept.push(pinhole);
                    first_error.get_or_insert(ChainError::dataplane(self.name, conn.id.clone(), e));
                }
            }
        }

        let mut opened = self.opened.lock();
        if kept.is_empty() {
            opened.remove(&conn.id);
        } else {
            opened.insert(conn.id.clone(), kept);
        }
        first_error.map_or(Ok(()), Err)
    }
}
