use {
    axum::body::Bytes,
    crate::domain::{error::ChargeError, provider::ProviderType},
    reqwest::{Client, Identity, RequestBuilder, StatusCode},
    serde::{Serialize, de::DeserializeOwned},
    std::time::Duration,
};

/// How a request proves who we are. Differs per provider, nothing else does.
#[derive(Clone)]
pub enum RequestAuth {
    None,
    Bearer(String),
    Basic { username: String, password: String },
    Header { name: &'static str, value: String },
}

impl RequestAuth {
    fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
        match self {
            Self::None => builder,
            Self::Bearer(token) => builder.bearer_auth(token),
            Self::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Self::Header { name, value } => builder.header(*name, value),
        }
    }
}

/// Maps a non-success HTTP status to the shared error kinds.
pub fn classify_status(provider: ProviderType, status: StatusCode, body: &str) -> ChargeError {
    let message = format!("{provider} answered {status}: {}", truncate(body, 512));
    match status {
        StatusCode::TOO_MANY_REQUESTS => ChargeError::Transient(message),
        s if s.is_server_error() => ChargeError::Transient(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChargeError::Authentication(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ChargeError::Validation(message)
        }
        _ => ChargeError::TerminalProvider(message),
    }
}

fn classify_transport(provider: ProviderType, err: reqwest::Error) -> ChargeError {
    if err.is_timeout() {
        ChargeError::Transient(format!("{provider} request timed out: {err}"))
    } else if err.is_connect() {
        ChargeError::Transient(format!("{provider} connection failed: {err}"))
    } else {
        ChargeError::Transient(format!("{provider} request failed: {err}"))
    }
}

fn truncate(body: &str, max: usize) -> &str {
    match body.char_indices().nth(max) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// One reqwest client per adapter instance.
pub struct ProviderHttpClient {
    client: Client,
    base_url: String,
    provider: ProviderType,
}

impl ProviderHttpClient {
    pub fn new(
        provider: ProviderType,
        base_url: impl Into<String>,
        timeout: Duration,
        identity: Option<Identity>,
    ) -> Result<Self, ChargeError> {
        let mut builder = Client::builder().timeout(timeout);
        if let Some(identity) = identity {
            builder = builder.identity(identity);
        }
        let client = builder.build().map_err(|e| {
            ChargeError::Configuration(format!("cannot build {provider} http client: {e}"))
        })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            provider,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        auth: &RequestAuth,
    ) -> Result<T, ChargeError> {
        let builder = self.client.get(self.url(path));
        let body = self.execute(auth.apply(builder)).await?;
        self.decode(&body)
    }

    pub async fn get_json_query<T: DeserializeOwned>(
        &self,
        path: &str,
        auth: &RequestAuth,
        query: &[(&str, &str)],
    ) -> Result<T, ChargeError> {
        let builder = self.client.get(self.url(path)).query(query);
        let body = self.execute(auth.apply(builder)).await?;
        self.decode(&body)
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        auth: &RequestAuth,
        body: &B,
        headers: &[(&'static str, &str)],
    ) -> Result<T, ChargeError> {
        let mut builder = self.client.post(self.url(path)).json(body);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let body = self.execute(auth.apply(builder)).await?;
        self.decode(&body)
    }

    pub async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        auth: &RequestAuth,
        form: &[(&str, &str)],
    ) -> Result<T, ChargeError> {
        let builder = self.client.post(self.url(path)).form(form);
        let body = self.execute(auth.apply(builder)).await?;
        self.decode(&body)
    }

    /// For endpoints whose success body we do not need (cancellations).
    pub async fn send_empty(
        &self,
        method: reqwest::Method,
        path: &str,
        auth: &RequestAuth,
        body: Option<&serde_json::Value>,
    ) -> Result<(), ChargeError> {
        let mut builder = self.client.request(method, self.url(path));
        if let Some(body) = body {
            builder = builder.json(body);
        }
        self.execute(auth.apply(builder)).await?;
        Ok(())
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<Bytes, ChargeError> {
        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport(self.provider, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = classify_status(self.provider, status, &body);
            tracing::debug!(provider = %self.provider, %status, error = %err, "provider call failed");
            return Err(err);
        }

        response
            .bytes()
            .await
            .map_err(|e| classify_transport(self.provider, e))
    }

    /// A 2xx body we cannot read is treated as a provider glitch and retried later.
    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, ChargeError> {
        serde_json::from_slice(body).map_err(|e| {
            ChargeError::Transient(format!(
                "{} returned an undecodable body: {e}",
                self.provider
            ))
        })
    }
}
