//! A client for the external authority that decides which GSAs a KSA may use
//! and that is told which GSAs are in use on each node.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;
mod wire;


pub use self::metrics::AuthorityMetrics;
use self::wire::Mapping;
use identity_controller_core::{GsaEmail, ServiceAccount};
use rand::Rng;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use std::{fmt, str::FromStr, time::Duration};
use tokio::time;
use tracing::{debug, instrument};

/// The authorization authority.
#[async_trait::async_trait]
pub trait Authority: Send + Sync + 'static {
    /// Asks whether `ksa` may impersonate `gsa`.
    async fn authorize(&self, ksa: &ServiceAccount, gsa: &GsaEmail) -> Result<bool, Error>;

    /// Reports the full set of GSAs in use on `node`.
    async fn sync(&self, node: &str, zone: &str, gsas: &[GsaEmail]) -> Result<(), Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to send {rpc} request: {source}")]
    Transport {
        rpc: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{rpc} request failed with HTTP {status}: {body}")]
    Status {
        rpc: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("invalid {rpc} JSON: {source}")]
    Json {
        rpc: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("authority response omits the requested mapping {ksa} -> {gsa}")]
    Protocol { ksa: ServiceAccount, gsa: GsaEmail },

    #[error("invalid authority URL {url:?}")]
    InvalidUrl { url: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
#[error("unknown authority protocol {0:?}; expected `current` or `legacy`")]
pub struct UnknownProtocol(pub String);

/// Selects the field names used on the wire.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Protocol {
    #[default]
    Current,
    Legacy,
}

/// Retry policy for failed requests.
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

/// Talks to the authority over HTTP with JSON bodies.
#[derive(Clone, Debug)]
pub struct HttpAuthority {
    client: reqwest::Client,
    authorize_url: Url,
    sync_url: Url,
    protocol: Protocol,
    backoff: Backoff,
    metrics: AuthorityMetrics,
}

const AUTHORIZE: &str = "authorize";
const SYNC: &str = "sync";

// === impl Protocol ===

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "current" => Ok(Self::Current),
            "legacy" => Ok(Self::Legacy),
            s => Err(UnknownProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => "current".fmt(f),
            Self::Legacy => "legacy".fmt(f),
        }
    }
}

impl Protocol {
    fn authorize_body(&self, mapping: Mapping) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Current => serde_json::to_value(wire::current::AuthorizeRequest {
                requested_mappings: vec![mapping.into()],
            }),
            Self::Legacy => serde_json::to_value(wire::legacy::AuthorizeRequest {
                mappings: vec![mapping.into()],
            }),
        }
    }

    fn authorize_response(&self, body: &[u8]) -> Result<wire::AuthorizeResponse, serde_json::Error> {
        match self {
            Self::Current => {
                serde_json::from_slice::<wire::current::AuthorizeResponse>(body).map(Into::into)
            }
            Self::Legacy => {
                serde_json::from_slice::<wire::legacy::AuthorizeResponse>(body).map(Into::into)
            }
        }
    }

    fn sync_body(
        &self,
        node: &str,
        zone: &str,
        gsas: Vec<&str>,
    ) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Current => serde_json::to_value(wire::current::SyncRequest {
                node,
                zone,
                gsa_emails: gsas,
            }),
            Self::Legacy => serde_json::to_value(wire::legacy::SyncRequest {
                node_name: node,
                zone,
                google_service_accounts: gsas,
            }),
        }
    }
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

// === impl HttpAuthority ===

impl HttpAuthority {
    pub fn new(
        url: &str,
        protocol: Protocol,
        backoff: Backoff,
        request_timeout: Duration,
        metrics: AuthorityMetrics,
    ) -> Result<Self, Error> {
        let endpoint = |path: &str| {
            let url = format!("{}/{}", url.trim_end_matches('/'), path);
            Url::parse(&url).map_err(|_| Error::InvalidUrl { url })
        };
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(Error::Client)?;

        Ok(Self {
            client,
            authorize_url: endpoint(AUTHORIZE)?,
            sync_url: endpoint(SYNC)?,
            protocol,
            backoff,
            metrics,
        })
    }

    /// Posts `body`, retrying transport failures and non-2xx responses.
    async fn post<T: Serialize + ?Sized>(
        &self,
        rpc: &'static str,
        url: &Url,
        body: &T,
    ) -> Result<reqwest::Response, Error> {
        let mut attempt = 0;
        let mut delay = self.backoff.initial_delay;
        loop {
            attempt += 1;
            self.metrics.request(rpc);

            let error = match self.client.post(url.clone()).json(body).send().await {
                Ok(rsp) if rsp.status().is_success() => return Ok(rsp),
                Ok(rsp) => {
                    let status = rsp.status();
                    let body = rsp.text().await.unwrap_or_default();
                    Error::Status { rpc, status, body }
                }
                Err(source) => Error::Transport { rpc, source },
            };
            self.metrics.failure(rpc);

            if attempt >= self.backoff.max_attempts {
                return Err(error);
            }

            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            let wait = delay.mul_f64(jitter);
            debug!(%error, attempt, ?wait, "Request failed; retrying");
            time::sleep(wait).await;
            delay = delay
                .mul_f64(self.backoff.multiplier)
                .min(self.backoff.max_delay);
        }
    }
}

#[async_trait::async_trait]
impl Authority for HttpAuthority {
    #[instrument(skip_all, fields(%ksa, %gsa))]
    async fn authorize(&self, ksa: &ServiceAccount, gsa: &GsaEmail) -> Result<bool, Error> {
        let requested = Mapping::new(ksa, gsa);
        let body = self
            .protocol
            .authorize_body(requested.clone())
            .map_err(|source| Error::Json {
                rpc: AUTHORIZE,
                source,
            })?;

        let rsp = self.post(AUTHORIZE, &self.authorize_url, &body).await?;
        let bytes = rsp.bytes().await.map_err(|source| Error::Transport {
            rpc: AUTHORIZE,
            source,
        })?;
        let wire::AuthorizeResponse { permitted, denied } = self
            .protocol
            .authorize_response(&bytes)
            .map_err(|source| Error::Json {
                rpc: AUTHORIZE,
                source,
            })?;

        if permitted.contains(&requested) {
            debug!("Permitted");
            return Ok(true);
        }
        if denied.contains(&requested) {
            debug!("Denied");
            self.metrics.denial();
            return Ok(false);
        }
        Err(Error::Protocol {
            ksa: ksa.clone(),
            gsa: gsa.clone(),
        })
    }

    #[instrument(skip(self, gsas), fields(gsas = gsas.len()))]
    async fn sync(&self, node: &str, zone: &str, gsas: &[GsaEmail]) -> Result<(), Error> {
        let mut emails = gsas.iter().map(GsaEmail::as_str).collect::<Vec<_>>();
        emails.sort_unstable();
        let body = self
            .protocol
            .sync_body(node, zone, emails)
            .map_err(|source| Error::Json { rpc: SYNC, source })?;

        self.post(SYNC, &self.sync_url, &body).await?;
        debug!("Synced");
        Ok(())
    }
}
