// HTTP repository implementation for the backend widget collection
use crate::application::widget_repository::{PersistenceError, WidgetRepository};
use crate::domain::widget::{ValidationError, Widget, WidgetSpec};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpWidgetRepository {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

/// `GET /widgets` answers either a bare array or a wrapper object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WidgetList {
    Bare(Vec<Widget>),
    Wrapped { widgets: Vec<Widget> },
}

impl HttpWidgetRepository {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, PersistenceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PersistenceError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn widgets_url(&self) -> String {
        format!("{}/widgets", self.base_url)
    }

    fn widget_url(&self, id: &str) -> String {
        format!("{}/widgets/{}", self.base_url, urlencoding::encode(id))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Accept", "application/json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, PersistenceError> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| PersistenceError::Unreachable(e.to_string()))
    }
}

async fn reject(response: Response) -> PersistenceError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            PersistenceError::Validation(ValidationError::Rejected { reason: rejection_reason(&body) })
        }
        _ => PersistenceError::Backend {
            status: status.as_u16(),
            body,
        },
    }
}

/// Pull a human readable reason out of an error body, falling back to the raw text.
fn rejection_reason(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            ["error", "message"]
                .iter()
                .find_map(|field| value.get(field).and_then(|v| v.as_str()).map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

async fn parse<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, PersistenceError> {
    response
        .json::<T>()
        .await
        .map_err(|e| PersistenceError::MalformedResponse(e.to_string()))
}

#[async_trait]
impl WidgetRepository for HttpWidgetRepository {
    async fn create(&self, spec: &WidgetSpec) -> Result<Widget, PersistenceError> {
        let response = self.send(self.client.post(self.widgets_url()).json(spec)).await?;
        if !response.status().is_success() {
            return Err(reject(response).await);
        }
        parse(response).await
    }

    async fn list(&self) -> Result<Vec<Widget>, PersistenceError> {
        let response = self.send(self.client.get(self.widgets_url())).await?;
        if !response.status().is_success() {
            return Err(reject(response).await);
        }
        Ok(match parse::<WidgetList>(response).await? {
            WidgetList::Bare(widgets) | WidgetList::Wrapped { widgets } => widgets,
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Widget>, PersistenceError> {
        let response = self.send(self.client.get(self.widget_url(id))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(reject(response).await);
        }
        parse(response).await.map(Some)
    }
}
