use async_trait::async_trait;
use auxparty_core::{RoomId, RoomSnapshot, UserId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    /// The server rejected the request. The message is shown to the user
    /// as-is.
    #[error("{0}")]
    Rejected(String),
    /// The request never completed.
    #[error("request failed: {0}")]
    Network(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// Body of create and join requests.
#[derive(Debug, Clone, Serialize)]
pub struct NewRoomRequest {
    pub user_id: UserId,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spotify_token: Option<String>,
}

/// The server's response to create and join requests.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomResponse {
    pub room_id: RoomId,
    pub room: RoomSnapshot,
}

/// Aggregate ready count returned by the ready endpoint.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ReadyResponse {
    pub joiners_ready: u32,
    pub total_joiners: u32,
}

/// The room lifecycle request/response surface the session depends on.
#[async_trait]
pub trait RoomApi: Send + Sync + 'static {
    async fn create_room(&self, request: NewRoomRequest) -> ApiResult<RoomResponse>;
    async fn join_room(&self, room_id: &str, request: NewRoomRequest) -> ApiResult<RoomResponse>;
    async fn leave_room(&self, room_id: &str, user_id: &str) -> ApiResult<()>;
    async fn request_sync(&self, room_id: &str) -> ApiResult<()>;
    async fn transfer_host(&self, room_id: &str, new_host_id: &str) -> ApiResult<()>;
    async fn mark_ready(&self, room_id: &str, user_id: &str) -> ApiResult<ReadyResponse>;
}

/// Talks to the room service over its json api.
pub struct HttpRoomApi {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl HttpRoomApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/rooms{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn into_result<T>(response: reqwest::Response) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        if response.status().is_success() {
            return Ok(response.json().await?);
        }

        Err(ApiError::Rejected(Self::error_message(response).await))
    }

    async fn into_empty_result(response: reqwest::Response) -> ApiResult<()> {
        if response.status().is_success() {
            return Ok(());
        }

        Err(ApiError::Rejected(Self::error_message(response).await))
    }

    async fn error_message(response: reqwest::Response) -> String {
        let status = response.status();

        response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| format!("Server returned {status}"))
    }
}

#[async_trait]
impl RoomApi for HttpRoomApi {
    async fn create_room(&self, request: NewRoomRequest) -> ApiResult<RoomResponse> {
        let response = self
            .http
            .post(self.url(""))
            .json(&request)
            .send()
            .await?;

        Self::into_result(response).await
    }

    async fn join_room(&self, room_id: &str, request: NewRoomRequest) -> ApiResult<RoomResponse> {
        let response = self
            .http
            .post(self.url(&format!("/{room_id}/join")))
            .json(&request)
            .send()
            .await?;

        Self::into_result(response).await
    }

    async fn leave_room(&self, room_id: &str, user_id: &str) -> ApiResult<()> {
        let response = self
            .http
            .post(self.url(&format!("/{room_id}/leave")))
            .json(&serde_json::json!({ "user_id": user_id }))
            .send()
            .await?;

        Self::into_empty_result(response).await
    }

    async fn request_sync(&self, room_id: &str) -> ApiResult<()> {
        let response = self
            .http
            .post(self.url(&format!("/{room_id}/sync")))
            .send()
            .await?;

        Self::into_empty_result(response).await
    }

    async fn transfer_host(&self, room_id: &str, new_host_id: &str) -> ApiResult<()> {
        let response = self
            .http
            .post(self.url(&format!("/{room_id}/transfer-host")))
            .json(&serde_json::json!({ "new_host_id": new_host_id }))
            .send()
            .await?;

        Self::into_empty_result(response).await
    }

    async fn mark_ready(&self, room_id: &str, user_id: &str) -> ApiResult<ReadyResponse> {
        let response = self
            .http
            .post(self.url(&format!("/{room_id}/ready")))
            .json(&serde_json::json!({ "user_id": user_id }))
            .send()
            .await?;

        Self::into_result(response).await
    }
}
