use async_trait::async_trait;

use crate::error::{FetchError, MutationError};
use crate::model::{ConversationKey, ItemId, ItemPage};

// ---------------------------------------------------------------------------
// ItemApi — the persistence seam
// ---------------------------------------------------------------------------

/// Server persistence for inbox items.
///
/// Injected into the store and the sync controller as `Arc<dyn ItemApi>` so
/// the whole sync core is testable with a scripted implementation and no
/// network in sight.
#[async_trait]
pub trait ItemApi: Send + Sync {
    /// Fetch one page of items for a conversation.
    ///
    /// `cursor` is `None` for a full fetch from the start, or the opaque
    /// token from a previous page. Output order is unspecified — callers
    /// must not assume sorted items.
    async fn list_items(
        &self,
        key: &ConversationKey,
        cursor: Option<&str>,
    ) -> Result<ItemPage, FetchError>;

    /// Persist the read flag for one item. Idempotent on the server.
    async fn mark_item_read(&self, id: &ItemId) -> Result<(), MutationError>;
}

// ---------------------------------------------------------------------------
// HttpItemApi
// ---------------------------------------------------------------------------

/// REST implementation of [`ItemApi`].
///
/// Routes:
/// - `GET {base}/inbox/{key}/items[?cursor=...]`
/// - `PUT {base}/inbox/items/{id}/read`
///
/// Ids and key segments are opaque and land in the path percent-encoded.
/// 4xx responses are permanent, 5xx and network-level failures transient.
pub struct HttpItemApi {
    base: String,
    client: reqwest::Client,
    bearer: Option<String>,
}

impl HttpItemApi {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        Self { base, client: reqwest::Client::new(), bearer: None }
    }

    /// Attach a bearer token to every request.
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Base url plus the given path segments, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, String> {
        let mut url =
            reqwest::Url::parse(&self.base).map_err(|e| format!("invalid base url: {e}"))?;
        url.path_segments_mut()
            .map_err(|_| "base url cannot carry a path".to_string())?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl ItemApi for HttpItemApi {
    async fn list_items(
        &self,
        key: &ConversationKey,
        cursor: Option<&str>,
    ) -> Result<ItemPage, FetchError> {
        let segments = match key {
            ConversationKey::Notifications => vec!["inbox", "notifications", "items"],
            ConversationKey::User(id) => vec!["inbox", "user", id.as_str(), "items"],
            ConversationKey::Group(id) => vec!["inbox", "group", id.as_str(), "items"],
        };
        let url = self.endpoint(&segments).map_err(FetchError::permanent)?;
        let mut req = self.authed(self.client.get(url));
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| FetchError::transient(format!("list items: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::from_status(
                status.as_u16(),
                format!("list items: {status}: {body}"),
            ));
        }

        resp.json::<ItemPage>()
            .await
            .map_err(|e| FetchError::permanent(format!("list items: malformed response: {e}")))
    }

    async fn mark_item_read(&self, id: &ItemId) -> Result<(), MutationError> {
        let url = self
            .endpoint(&["inbox", "items", id.as_str(), "read"])
            .map_err(|e| {
                MutationError::single(id.clone(), crate::error::ErrorClass::Permanent, e)
            })?;
        let resp = self
            .authed(self.client.put(url))
            .send()
            .await
            .map_err(|e| {
                MutationError::single(
                    id.clone(),
                    crate::error::ErrorClass::Transient,
                    format!("mark read: {e}"),
                )
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MutationError::from_status(
                id.clone(),
                status.as_u16(),
                format!("mark read: {status}: {body}"),
            ));
        }

        Ok(())
    }
}
