//! Method dispatch for the registry endpoint.
//!
//! Routes each JSON-RPC method to the reservation protocol, probing Active
//! records on query so a dead window is never handed out as "existing".

use crate::config::RegistrySettings;
use crate::ipc::protocol::{
    methods, GrantedReservation, InstanceSummary, QueryParams, QueryResult, RegisterParams,
    UnregisterParams,
};
use crate::ipc::IpcDispatch;
use crate::liveness::LivenessProber;
use crate::registry::{ActiveInstance, Lookup, ProbeAction, RegistryStore};
use crate::remote::Probe;
use crate::reservation::{Claim, ReservationProtocol};
use crate::shutdown::ShutdownSignal;
use crate::{RegistryError, Result};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Registry state shared with the endpoint.
pub struct RegistryService {
    protocol: ReservationProtocol,
    prober: Arc<LivenessProber>,
    probe_on_query: bool,
    shutdown: ShutdownSignal,
}

impl RegistryService {
    pub fn new(
        store: Arc<RegistryStore>,
        probe: Arc<dyn Probe>,
        settings: &RegistrySettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        let prober = Arc::new(LivenessProber::new(store.clone(), probe, settings));
        Self {
            protocol: ReservationProtocol::new(store),
            prober,
            probe_on_query: settings.probe_on_query,
            shutdown,
        }
    }

    /// The prober, for running the background sweep.
    pub fn prober(&self) -> Arc<LivenessProber> {
        self.prober.clone()
    }

    pub fn store(&self) -> &Arc<RegistryStore> {
        self.protocol.store()
    }

    /// Probe `instance` when enabled. Returns false if it did not survive.
    async fn still_alive(&self, instance: &ActiveInstance) -> bool {
        if !self.probe_on_query {
            return true;
        }
        matches!(
            self.prober.check(instance).await,
            Some(ProbeAction::MarkReachable) | Some(ProbeAction::Keep)
        )
    }

    async fn query(&self, params: QueryParams) -> Result<Option<QueryResult>> {
        let identifier = params.identifier.as_str();

        if params.reserve {
            let mut claim = self.protocol.find_or_claim(identifier);
            if let Claim::Existing(instance) = &claim {
                if !self.still_alive(instance).await {
                    // Re-read once; the probe just evicted or replaced it.
                    claim = self.protocol.find_or_claim(identifier);
                }
            }
            return match claim {
                Claim::Existing(instance) => Ok(Some(QueryResult::Active(self.refreshed(instance)))),
                Claim::Granted(reservation) => {
                    info!("Granted reservation for {}", identifier);
                    Ok(Some(QueryResult::Reserved(GrantedReservation::from_reservation(
                        reservation,
                        Instant::now(),
                    ))))
                }
                Claim::Pending { .. } => Err(RegistryError::ReservationPending {
                    identifier: identifier.to_string(),
                }),
            };
        }

        let mut lookup = self.protocol.store().lookup(identifier);
        if let Lookup::Active(instance) = &lookup {
            if !self.still_alive(instance).await {
                lookup = self.protocol.store().lookup(identifier);
            }
        }
        match lookup {
            Lookup::Active(instance) => Ok(Some(QueryResult::Active(self.refreshed(instance)))),
            Lookup::Reserved { .. } => Err(RegistryError::ReservationPending {
                identifier: identifier.to_string(),
            }),
            Lookup::Absent => Ok(None),
        }
    }

    /// Pick up a probe success recorded after `instance` was read.
    fn refreshed(&self, instance: ActiveInstance) -> InstanceSummary {
        match self.protocol.store().lookup(&instance.identifier) {
            Lookup::Active(current) if current.generation == instance.generation => current.into(),
            _ => instance.into(),
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: serde_json::Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| RegistryError::InvalidParams {
        message: e.to_string(),
    })
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(RegistryError::InvalidParams {
            message: format!("{} must not be empty", field),
        });
    }
    Ok(())
}

#[async_trait::async_trait]
impl IpcDispatch for RegistryService {
    async fn dispatch(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        match method {
            methods::QUERY_INSTANCE => {
                let params: QueryParams = parse_params(params)?;
                require_non_empty("identifier", &params.identifier)?;
                let result = self.query(params).await?;
                Ok(serde_json::to_value(result)?)
            }
            methods::LIST_INSTANCES => {
                let instances: Vec<InstanceSummary> = self
                    .protocol
                    .store()
                    .list()
                    .into_iter()
                    .map(InstanceSummary::from)
                    .collect();
                Ok(serde_json::to_value(instances)?)
            }
            methods::REGISTER_INSTANCE => {
                let params: RegisterParams = parse_params(params)?;
                require_non_empty("identifier", &params.identifier)?;
                require_non_empty("server_address", &params.server_address)?;
                self.protocol.register(
                    &params.identifier,
                    &params.server_address,
                    params.reservation_token.as_ref(),
                )?;
                Ok(serde_json::json!("registered"))
            }
            methods::UNREGISTER_INSTANCE => {
                let params: UnregisterParams = parse_params(params)?;
                require_non_empty("identifier", &params.identifier)?;
                match &params.reservation_token {
                    Some(token) => self.protocol.release(&params.identifier, token)?,
                    None => {
                        self.protocol.unregister(&params.identifier)?;
                    }
                }
                Ok(serde_json::json!("unregistered"))
            }
            methods::SHUTDOWN => {
                info!("Shutdown requested over IPC");
                self.shutdown.trigger();
                Ok(serde_json::json!("shutting_down"))
            }
            _ => {
                debug!("Unknown method {}", method);
                Err(RegistryError::MethodNotFound {
                    method: method.to_string(),
                })
            }
        }
    }
}
