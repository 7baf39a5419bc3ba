use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{multipart, Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Chat, ChatId, Message, UserId, UserRecord},
    protocol::{CreateChatRequest, CreateMessageRequest, ProfileUpdate, TokenPair, TokenRequest},
};
use tracing::debug;

use crate::{
    error::{ClientError, ClientResult},
    session::SessionContext,
};

#[derive(Debug, Clone)]
pub struct AvatarUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// REST collaborator used by the store and the directory cache.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_chats(&self) -> ClientResult<Vec<Chat>>;
    async fn get_chat(&self, chat_id: ChatId) -> ClientResult<Chat>;
    async fn create_chat(&self, request: &CreateChatRequest) -> ClientResult<Chat>;
    async fn list_messages(&self, chat_id: ChatId) -> ClientResult<Vec<Message>>;
    async fn create_message(&self, request: &CreateMessageRequest) -> ClientResult<Message>;
    async fn get_user(&self, user_id: UserId) -> ClientResult<UserRecord>;
    async fn current_user(&self) -> ClientResult<UserRecord>;
    async fn update_user(&self, user_id: UserId, update: &ProfileUpdate)
        -> ClientResult<UserRecord>;
    async fn delete_user(&self, user_id: UserId) -> ClientResult<()>;
    async fn upload_avatar(&self, user_id: UserId, upload: AvatarUpload)
        -> ClientResult<UserRecord>;
}

pub struct RestGateway {
    http: Client,
    api_url: String,
    session: Arc<SessionContext>,
}

impl RestGateway {
    pub fn new(api_url: impl Into<String>, session: Arc<SessionContext>) -> Self {
        let api_url: String = api_url.into();
        Self {
            http: Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            session,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_url)
    }

    /// Exchanges username/password for a bearer credential. This is the only
    /// call that does not require an existing session.
    pub async fn obtain_token(&self, username: &str, password: &str) -> ClientResult<TokenPair> {
        let builder = self
            .http
            .post(self.url("/auth/login/"))
            .json(&TokenRequest {
                username: username.to_string(),
                password: password.to_string(),
            });
        send_json(builder).await
    }

    /// Fails fast when no credential is present instead of issuing an
    /// anonymous request.
    async fn authorized(&self, method: Method, path: &str) -> ClientResult<RequestBuilder> {
        let credential = self.session.credential().await.ok_or_else(|| {
            ClientError::Authentication("no session credential available".to_string())
        })?;
        debug!(%method, path, "gateway: request");
        Ok(self
            .http
            .request(method, self.url(path))
            .bearer_auth(credential))
    }
}

async fn check_status(response: Response) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::from_status(status.as_u16(), &body))
}

async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> ClientResult<T> {
    let response = check_status(builder.send().await?).await?;
    Ok(response.json().await?)
}

#[async_trait]
impl ChatApi for RestGateway {
    async fn list_chats(&self) -> ClientResult<Vec<Chat>> {
        send_json(self.authorized(Method::GET, "/chats/").await?).await
    }

    async fn get_chat(&self, chat_id: ChatId) -> ClientResult<Chat> {
        let path = format!("/chats/{chat_id}/");
        send_json(self.authorized(Method::GET, &path).await?).await
    }

    async fn create_chat(&self, request: &CreateChatRequest) -> ClientResult<Chat> {
        let builder = self.authorized(Method::POST, "/chats/").await?.json(request);
        send_json(builder).await
    }

    async fn list_messages(&self, chat_id: ChatId) -> ClientResult<Vec<Message>> {
        let builder = self
            .authorized(Method::GET, "/messages/")
            .await?
            .query(&[("chat", chat_id.0)]);
        send_json(builder).await
    }

    async fn create_message(&self, request: &CreateMessageRequest) -> ClientResult<Message> {
        let builder = self
            .authorized(Method::POST, "/messages/")
            .await?
            .json(request);
        send_json(builder).await
    }

    async fn get_user(&self, user_id: UserId) -> ClientResult<UserRecord> {
        let path = format!("/users/{user_id}/");
        send_json(self.authorized(Method::GET, &path).await?).await
    }

    async fn current_user(&self) -> ClientResult<UserRecord> {
        send_json(self.authorized(Method::GET, "/users/me/").await?).await
    }

    async fn update_user(
        &self,
        user_id: UserId,
        update: &ProfileUpdate,
    ) -> ClientResult<UserRecord> {
        let path = format!("/users/{user_id}/");
        let builder = self.authorized(Method::PATCH, &path).await?.json(update);
        send_json(builder).await
    }

    async fn delete_user(&self, user_id: UserId) -> ClientResult<()> {
        let path = format!("/users/{user_id}/");
        let builder = self.authorized(Method::DELETE, &path).await?;
        check_status(builder.send().await?).await?;
        Ok(())
    }

    async fn upload_avatar(
        &self,
        user_id: UserId,
        upload: AvatarUpload,
    ) -> ClientResult<UserRecord> {
        let mime_type = upload
            .mime_type
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let part = multipart::Part::bytes(upload.bytes)
            .file_name(upload.filename)
            .mime_str(&mime_type)?;
        let form = multipart::Form::new().part("avatar", part);
        let path = format!("/users/{user_id}/upload_avatar/");
        let builder = self.authorized(Method::POST, &path).await?.multipart(form);
        send_json(builder).await
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
