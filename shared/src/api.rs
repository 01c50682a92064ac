//! Resilient API client.
//!
//! Every backend call is tracked by its [`RequestId`] until it resolves.
//! A 401 triggers at most one `POST /refresh` for the whole client: calls
//! that hit 401 while a refresh is in flight park behind it and are replayed
//! once it lands. Each call is replayed at most once, so a second 401 is
//! terminal and refresh loops cannot happen. When there is nothing to
//! refresh with, or the refresh itself fails, the session is torn down.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::auth::{AuthContext, RefreshResponse};
use crate::capabilities::{
    Capabilities, HttpError, HttpMethod, HttpOutcome, HttpReply, OutboundRequest,
};
use crate::model::{IdGen, RequestId};
use crate::search::SearchField;
use crate::{AppError, ErrorKind};

pub mod endpoints {
    pub const REGISTER: &str = "/user";
    pub const LOGIN: &str = "/login";
    pub const LOGOUT: &str = "/logout";
    pub const REFRESH: &str = "/refresh";
    pub const TRIP_PREVIEW: &str = "/trip-preview";
    pub const TRIP: &str = "/trip";
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("{message}")]
    Unauthorized { message: String },

    #[error("Your session has expired. Please sign in again.")]
    SessionExpired,

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request could not be built: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            ApiError::Rejected { status, .. } => Some(*status),
            ApiError::Unauthorized { .. } => Some(401),
            _ => None,
        }
    }

    fn from_transport(err: &HttpError) -> Self {
        match err {
            HttpError::Timeout => ApiError::Timeout,
            HttpError::Connection { message } => ApiError::Network(message.clone()),
            HttpError::InvalidResponse { .. } => ApiError::InvalidResponse(err.to_string()),
            _ => ApiError::InvalidRequest(err.to_string()),
        }
    }
}

impl From<&ApiError> for AppError {
    fn from(e: &ApiError) -> Self {
        let kind = match e {
            ApiError::Rejected { status, .. } => ErrorKind::from_http_status(*status),
            ApiError::Unauthorized { .. } => ErrorKind::Authentication,
            ApiError::SessionExpired => ErrorKind::SessionExpired,
            ApiError::Timeout => ErrorKind::Timeout,
            ApiError::Network(_) => ErrorKind::Network,
            ApiError::InvalidResponse(_) => ErrorKind::Serialization,
            ApiError::InvalidRequest(_) => ErrorKind::Internal,
        };
        let err = AppError::new(kind, e.message());
        match e.status() {
            Some(status) => err.with_context("http_status", status.to_string()),
            None => err,
        }
    }
}

/// A backend call: method, path relative to the API base, optional JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCall {
    pub method: HttpMethod,
    pub path: String,
    pub body: Option<Value>,
}

impl ApiCall {
    #[must_use]
    pub fn post(path: &str, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.to_string(),
            body: Some(body),
        }
    }

    #[must_use]
    pub fn get(path: &str) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.to_string(),
            body: None,
        }
    }
}

/// What a resolved call was for; routes the completion back to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiPurpose {
    Login,
    Register,
    Logout,
    TripPreview { epoch: u64 },
    CreateTrip { epoch: u64 },
    Geocode { field: SearchField, seq: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiCompletion {
    pub purpose: ApiPurpose,
    pub result: Result<Value, ApiError>,
}

#[derive(Debug, Default)]
pub struct ApiResolution {
    pub completions: Vec<ApiCompletion>,
    /// The session was torn down while handling this response.
    pub session_ended: bool,
}

impl ApiResolution {
    fn complete(purpose: ApiPurpose, result: Result<Value, ApiError>) -> Self {
        Self {
            completions: vec![ApiCompletion { purpose, result }],
            session_ended: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    AwaitingRefresh,
    Replayed,
}

#[derive(Debug)]
enum CallKind {
    Backend { call: ApiCall, generation: u64 },
    External,
}

#[derive(Debug)]
struct PendingCall {
    purpose: ApiPurpose,
    kind: CallKind,
    attempt: Attempt,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<EnvelopeError>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    #[serde(default)]
    #[allow(dead_code)]
    code: Option<Value>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    #[allow(dead_code)]
    details: Option<HashMap<String, Value>>,
}

#[derive(Debug)]
pub struct ApiClient {
    base_url: String,
    pending: BTreeMap<RequestId, PendingCall>,
    refresh: Option<RequestId>,
}

impl ApiClient {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            pending: BTreeMap::new(),
            refresh: None,
        }
    }

    /// Point later calls at another backend. Calls in flight still resolve.
    pub fn set_base_url(&mut self, base_url: &str) {
        self.base_url = base_url.trim_end_matches('/').to_string();
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.refresh.is_some()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len() + usize::from(self.refresh.is_some())
    }

    /// Issue a backend call signed with the current access token, if any.
    #[instrument(skip(self, call, auth, ids, caps), fields(path = %call.path))]
    pub fn request(
        &mut self,
        call: ApiCall,
        purpose: ApiPurpose,
        auth: &AuthContext,
        ids: &mut IdGen,
        caps: &Capabilities,
    ) -> Result<RequestId, ApiError> {
        let id = ids.next();
        let request = self.backend_request(id, &call, auth.access_token())?;
        request.send(&caps.http);
        self.pending.insert(
            id,
            PendingCall {
                purpose,
                kind: CallKind::Backend {
                    call,
                    generation: auth.generation(),
                },
                attempt: Attempt::First,
            },
        );
        debug!(request = %id, "api call issued");
        Ok(id)
    }

    /// Issue an unauthenticated GET to a third-party service. The body is
    /// returned as raw JSON; no envelope, no refresh.
    pub fn request_external(
        &mut self,
        url: &str,
        purpose: ApiPurpose,
        ids: &mut IdGen,
        caps: &Capabilities,
    ) -> Result<RequestId, ApiError> {
        let id = ids.next();
        let request = OutboundRequest::get(id, url)
            .and_then(|r| r.with_header("Accept", "application/json"))
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        request.send(&caps.http);
        self.pending.insert(
            id,
            PendingCall {
                purpose,
                kind: CallKind::External,
                attempt: Attempt::First,
            },
        );
        Ok(id)
    }

    /// Forget everything in flight; late responses will be ignored.
    pub fn abandon_all(&mut self) {
        if !self.pending.is_empty() || self.refresh.is_some() {
            debug!(count = self.in_flight(), "abandoning in-flight calls");
        }
        self.pending.clear();
        self.refresh = None;
    }

    pub fn handle_response(
        &mut self,
        id: RequestId,
        result: HttpOutcome,
        auth: &mut AuthContext,
        ids: &mut IdGen,
        caps: &Capabilities,
    ) -> ApiResolution {
        if self.refresh == Some(id) {
            self.refresh = None;
            return self.on_refresh_result(result, auth, ids, caps);
        }

        let Some(pending) = self.pending.remove(&id) else {
            debug!(request = %id, "response for unknown or abandoned call ignored");
            return ApiResolution::default();
        };

        let generation = match &pending.kind {
            CallKind::External => {
                return ApiResolution::complete(pending.purpose, Self::parse_external(&result));
            }
            CallKind::Backend { generation, .. } => *generation,
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(request = %id, error = %e, "api transport failure");
                return ApiResolution::complete(pending.purpose, Err(ApiError::from_transport(&e)));
            }
        };

        if !response.is_unauthorized() || pending.attempt != Attempt::First {
            return ApiResolution::complete(pending.purpose, Self::parse_envelope(&response));
        }

        self.on_unauthorized(id, pending, generation, &response, auth, ids, caps)
    }

    #[allow(clippy::too_many_arguments)]
    fn on_unauthorized(
        &mut self,
        id: RequestId,
        mut pending: PendingCall,
        generation: u64,
        response: &HttpReply,
        auth: &mut AuthContext,
        ids: &mut IdGen,
        caps: &Capabilities,
    ) -> ApiResolution {
        // Signed with a token that has since been replaced: just resend.
        if generation < auth.generation() && auth.access_token().is_some() {
            debug!(request = %id, "replaying with newer access token");
            return self.replay(pending, auth, ids, caps);
        }

        if self.refresh.is_some() {
            debug!(request = %id, "parked behind in-flight refresh");
            pending.attempt = Attempt::AwaitingRefresh;
            self.pending.insert(id, pending);
            return ApiResolution::default();
        }

        let Some(refresh_token) = auth.refresh_token().map(str::to_string) else {
            let error = match Self::parse_envelope(response) {
                Err(e @ ApiError::Unauthorized { .. }) => e,
                _ => ApiError::Unauthorized {
                    message: "Unauthorized".to_string(),
                },
            };
            let mut resolution = ApiResolution::complete(pending.purpose, Err(error));
            if auth.is_authenticated() {
                warn!("401 without refresh token, ending session");
                resolution.completions.extend(self.fail_closed(auth, caps));
                resolution.session_ended = true;
            }
            return resolution;
        };

        let refresh_id: RequestId = ids.next();
        let request = OutboundRequest::post(refresh_id, &self.url_for(endpoints::REFRESH))
            .and_then(|r| r.with_json(&serde_json::json!({ "refresh_token": refresh_token })));

        match request {
            Ok(request) => {
                info!(request = %id, "access token expired, refreshing");
                request.send(&caps.http);
                self.refresh = Some(refresh_id);
                pending.attempt = Attempt::AwaitingRefresh;
                self.pending.insert(id, pending);
                ApiResolution::default()
            }
            Err(e) => ApiResolution::complete(
                pending.purpose,
                Err(ApiError::InvalidRequest(e.to_string())),
            ),
        }
    }

    fn on_refresh_result(
        &mut self,
        result: HttpOutcome,
        auth: &mut AuthContext,
        ids: &mut IdGen,
        caps: &Capabilities,
    ) -> ApiResolution {
        let tokens = match result {
            Ok(response) if response.is_success() => Self::parse_envelope(&response)
                .and_then(|data| {
                    serde_json::from_value::<RefreshResponse>(data)
                        .map_err(|e| ApiError::InvalidResponse(e.to_string()))
                }),
            Ok(response) => Err(ApiError::Rejected {
                status: response.status(),
                message: "refresh rejected".to_string(),
            }),
            Err(e) => Err(ApiError::from_transport(&e)),
        };

        match tokens {
            Ok(tokens) => {
                if !auth.update_tokens(tokens.access_token, tokens.refresh_token, caps) {
                    return ApiResolution {
                        completions: self.reject_waiting(),
                        session_ended: false,
                    };
                }
                let waiting = self.take_waiting();
                info!(count = waiting.len(), "refresh succeeded, replaying parked calls");
                let mut resolution = ApiResolution::default();
                for pending in waiting {
                    let replayed = self.replay(pending, auth, ids, caps);
                    resolution.completions.extend(replayed.completions);
                }
                resolution
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed, ending session");
                let mut completions = self.reject_waiting();
                completions.extend(self.fail_closed(auth, caps));
                ApiResolution {
                    completions,
                    session_ended: true,
                }
            }
        }
    }

    fn replay(
        &mut self,
        mut pending: PendingCall,
        auth: &AuthContext,
        ids: &mut IdGen,
        caps: &Capabilities,
    ) -> ApiResolution {
        let CallKind::Backend { call, generation } = &mut pending.kind else {
            return ApiResolution::default();
        };

        let id = ids.next();
        match self.backend_request(id, call, auth.access_token()) {
            Ok(request) => {
                request.send(&caps.http);
                *generation = auth.generation();
                pending.attempt = Attempt::Replayed;
                self.pending.insert(id, pending);
                ApiResolution::default()
            }
            Err(e) => ApiResolution::complete(pending.purpose, Err(e)),
        }
    }

    fn take_waiting(&mut self) -> Vec<PendingCall> {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.attempt == Attempt::AwaitingRefresh)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    fn reject_waiting(&mut self) -> Vec<ApiCompletion> {
        self.take_waiting()
            .into_iter()
            .map(|p| ApiCompletion {
                purpose: p.purpose,
                result: Err(ApiError::SessionExpired),
            })
            .collect()
    }

    /// Tear the session down and reject every other backend call in flight.
    /// Telling the user is up to whoever sees `session_ended`.
    fn fail_closed(&mut self, auth: &mut AuthContext, caps: &Capabilities) -> Vec<ApiCompletion> {
        auth.clear(caps);

        let backend: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| matches!(p.kind, CallKind::Backend { .. }))
            .map(|(id, _)| *id)
            .collect();
        backend
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|p| ApiCompletion {
                purpose: p.purpose,
                result: Err(ApiError::SessionExpired),
            })
            .collect()
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn backend_request(
        &self,
        id: RequestId,
        call: &ApiCall,
        token: Option<&str>,
    ) -> Result<OutboundRequest, ApiError> {
        let mut request = OutboundRequest::new(id, call.method, &self.url_for(&call.path))
            .and_then(|r| r.with_header("Accept", "application/json"))
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        if let Some(body) = &call.body {
            request = request
                .with_json(body)
                .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        }
        if let Some(token) = token {
            request = request
                .with_bearer(token)
                .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        }
        Ok(request)
    }

    /// `{ data }` on success, `{ error: { message } }` otherwise.
    pub fn parse_envelope(response: &HttpReply) -> Result<Value, ApiError> {
        let envelope = if response.body().iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            serde_json::from_slice::<Envelope>(response.body()).ok()
        };

        if response.is_success() {
            return match envelope {
                Some(envelope) => Ok(envelope.data.unwrap_or(Value::Null)),
                None if response.body().iter().all(u8::is_ascii_whitespace) => Ok(Value::Null),
                None => Err(ApiError::InvalidResponse(
                    "response is not a JSON envelope".to_string(),
                )),
            };
        }

        let message = envelope
            .and_then(|e| e.error)
            .map(|e| e.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("Request failed with status {}", response.status()));

        if response.is_unauthorized() {
            Err(ApiError::Unauthorized { message })
        } else {
            Err(ApiError::Rejected {
                status: response.status(),
                message,
            })
        }
    }

    fn parse_external(result: &HttpOutcome) -> Result<Value, ApiError> {
        match result {
            Ok(response) if response.is_success() => serde_json::from_slice::<Value>(response.body())
                .map_err(|e| ApiError::InvalidResponse(e.to_string())),
            Ok(response) => Err(ApiError::Rejected {
                status: response.status(),
                message: format!("Request failed with status {}", response.status()),
            }),
            Err(e) => Err(ApiError::from_transport(e)),
        }
    }
}
