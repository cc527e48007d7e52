//! One-shot primary → backup connection.
//!
//! The primary is tried once; on any failure (including a connect timeout) the backup
//! is tried once with the identical setup. No retry loop, no backoff.

use crate::error::{ConnectError, TransportError};
use crate::transport::{Connection, Connector, Endpoint, EndpointRole, SessionSetup};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const NO_BACKUP_CONFIGURED: &str = "no backup endpoint configured";

/// The connection that was opened and how we got there.
#[derive(Debug)]
pub struct FailoverOutcome {
    pub connection: Connection,
    pub role: EndpointRole,
    pub endpoint: String,
    /// Why the primary was abandoned, if it was.
    pub primary_failure: Option<String>,
}

#[derive(Clone)]
pub struct FailoverConnector {
    connector: Arc<dyn Connector>,
    primary: Endpoint,
    backup: Option<Endpoint>,
    connect_timeout: Duration,
}

impl FailoverConnector {
    pub fn new(
        connector: Arc<dyn Connector>,
        primary: Endpoint,
        backup: Option<Endpoint>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            primary,
            backup,
            connect_timeout,
        }
    }

    pub fn primary(&self) -> &Endpoint {
        &self.primary
    }

    pub fn backup(&self) -> Option<&Endpoint> {
        self.backup.as_ref()
    }

    pub async fn connect(&self, setup: &SessionSetup) -> Result<FailoverOutcome, ConnectError> {
        let primary_failure = match self.attempt(&self.primary, setup).await {
            Ok(connection) => {
                info!("🔌 Connected to primary endpoint '{}'", self.primary.name);
                return Ok(FailoverOutcome {
                    connection,
                    role: EndpointRole::Primary,
                    endpoint: self.primary.name.clone(),
                    primary_failure: None,
                });
            }
            Err(e) => e.to_string(),
        };

        warn!(
            endpoint = %self.primary.name,
            "Primary endpoint failed: {}; trying backup", primary_failure
        );

        let Some(backup) = &self.backup else {
            return Err(ConnectError::BothFailed {
                primary: primary_failure,
                backup: NO_BACKUP_CONFIGURED.to_string(),
            });
        };

        match self.attempt(backup, setup).await {
            Ok(connection) => {
                info!("🔌 Connected to backup endpoint '{}'", backup.name);
                Ok(FailoverOutcome {
                    connection,
                    role: EndpointRole::Backup,
                    endpoint: backup.name.clone(),
                    primary_failure: Some(primary_failure),
                })
            }
            Err(e) => {
                warn!(endpoint = %backup.name, "Backup endpoint failed: {}", e);
                Err(ConnectError::BothFailed {
                    primary: primary_failure,
                    backup: e.to_string(),
                })
            }
        }
    }

    async fn attempt(
        &self,
        endpoint: &Endpoint,
        setup: &SessionSetup,
    ) -> Result<Connection, TransportError> {
        match tokio::time::timeout(self.connect_timeout, self.connector.connect(endpoint, setup)).await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.connect_timeout.as_millis() as u64)),
        }
    }
}
