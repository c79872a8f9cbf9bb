// =============================================================================
// Tessera Federation - Client Module
// =============================================================================
//
// Project: Tessera - High Performance Matrix Homeserver
// License: Apache 2.0 / MIT
//
// Description:
//   The outbound federation client surface used by the room server, and its
//   HTTP implementation over the Server-Server API v1 endpoints.
//
// =============================================================================

use async_trait::async_trait;
use reqwest::{Client as HttpClient, Url};
use ruma::{EventId, OwnedEventId, RoomId, ServerName};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::{
    config::FederationConfig,
    error::{FederationError, Result},
    types::{RoomStateResponse, StateIdsResponse, Transaction},
};

/// Outbound federation operations required by the room server.
///
/// Every call names the local `origin` (virtual host) the request is made on
/// behalf of, and the remote `server` it is sent to.
#[async_trait]
pub trait FederationClient: Send + Sync {
    /// Requests historical events for a room from a remote server.
    ///
    /// https://matrix.org/docs/spec/server_server/latest#get-matrix-federation-v1-backfill-roomid
    async fn backfill(
        &self,
        origin: &ServerName,
        server: &ServerName,
        room_id: &RoomId,
        limit: usize,
        from_event_ids: &[OwnedEventId],
    ) -> Result<Transaction>;

    /// Fetches a single event from a remote server.
    async fn get_event(
        &self,
        origin: &ServerName,
        server: &ServerName,
        event_id: &EventId,
    ) -> Result<Transaction>;

    /// Fetches the IDs of the room state before an event.
    async fn get_state_ids(
        &self,
        origin: &ServerName,
        server: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<StateIdsResponse>;

    /// Fetches the full room state before an event.
    async fn get_state(
        &self,
        origin: &ServerName,
        server: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<RoomStateResponse>;
}

/// Federation client implementation over HTTPS.
///
/// Requests are sent unsigned; deployments front this client with their
/// outbound signing layer.
#[derive(Debug, Clone)]
pub struct HttpFederationClient {
    config: FederationConfig,
    http_client: HttpClient,
}

impl HttpFederationClient {
    /// Creates a new federation client
    pub fn new(config: FederationConfig) -> Result<Self> {
        config.validate()?;

        let http_client = HttpClient::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// The configuration this client was built with
    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    fn endpoint(
        &self,
        server: &ServerName,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<Url> {
        let mut url = Url::parse(&format!("https://{server}"))
            .map_err(|e| FederationError::internal(format!("invalid server name URL: {e}")))?;
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                FederationError::internal("server name is not a valid URL base".to_owned())
            })?;
            path.extend(["_matrix", "federation", "v1"]);
            path.extend(segments);
        }
        url.query_pairs_mut().extend_pairs(query);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, server: &ServerName, url: Url) -> Result<T> {
        debug!(%url, "📤 Sending federation request");
        let response = self.http_client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FederationError::Server {
                server: server.to_owned(),
                status: status.as_u16(),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl FederationClient for HttpFederationClient {
    #[instrument(level = "debug", skip(self, from_event_ids), fields(%origin, %server, %room_id))]
    async fn backfill(
        &self,
        origin: &ServerName,
        server: &ServerName,
        room_id: &RoomId,
        limit: usize,
        from_event_ids: &[OwnedEventId],
    ) -> Result<Transaction> {
        let limit = limit.to_string();
        let mut query: Vec<(&str, &str)> = vec![("limit", limit.as_str())];
        for id in from_event_ids {
            query.push(("v", id.as_str()));
        }
        let url = self.endpoint(server, &["backfill", room_id.as_str()], &query)?;
        self.get_json(server, url).await
    }

    #[instrument(level = "debug", skip(self), fields(%origin, %server, %event_id))]
    async fn get_event(
        &self,
        origin: &ServerName,
        server: &ServerName,
        event_id: &EventId,
    ) -> Result<Transaction> {
        let url = self.endpoint(server, &["event", event_id.as_str()], &[])?;
        self.get_json(server, url).await
    }

    #[instrument(level = "debug", skip(self), fields(%origin, %server, %room_id, %event_id))]
    async fn get_state_ids(
        &self,
        origin: &ServerName,
        server: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<StateIdsResponse> {
        let url = self.endpoint(
            server,
            &["state_ids", room_id.as_str()],
            &[("event_id", event_id.as_str())],
        )?;
        self.get_json(server, url).await
    }

    #[instrument(level = "debug", skip(self), fields(%origin, %server, %room_id, %event_id))]
    async fn get_state(
        &self,
        origin: &ServerName,
        server: &ServerName,
        room_id: &RoomId,
        event_id: &EventId,
    ) -> Result<RoomStateResponse> {
        let url = self.endpoint(
            server,
            &["state", room_id.as_str()],
            &[("event_id", event_id.as_str())],
        )?;
        self.get_json(server, url).await
    }
}
