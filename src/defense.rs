//! Defensive-signal detection.
//!
//! Looks for CDN/WAF fronting on the target through its CNAME chain and the headers
//! of a plain HTTP request. A match escalates the session's throttle. Probe requests
//! are counted against the same throttle as the phase tools.

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::HeaderMap;
use std::fmt;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::throttle::ThrottleController;

/// Where a signal was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalSource {
    Cname(String),
    Header(String),
    /// Reported by a phase worker
    Worker(String),
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cname(name) => write!(f, "CNAME {}", name),
            Self::Header(name) => write!(f, "header {}", name),
            Self::Worker(name) => write!(f, "worker {}", name),
        }
    }
}

/// A detected defensive measure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefenseSignal {
    pub provider: String,
    pub source: SignalSource,
}

enum HeaderRule {
    Present(&'static str),
    Contains(&'static str, &'static str),
}

struct Fingerprint {
    provider: &'static str,
    cname: &'static str,
    headers: &'static [HeaderRule],
}

const FINGERPRINTS: &[Fingerprint] = &[
    Fingerprint {
        provider: "Cloudflare",
        cname: r"\.cdn\.cloudflare\.net$|\.cloudflare\.net$",
        headers: &[
            HeaderRule::Present("cf-ray"),
            HeaderRule::Present("cf-cache-status"),
            HeaderRule::Contains("server", "cloudflare"),
        ],
    },
    Fingerprint {
        provider: "AWS CloudFront",
        cname: r"\.cloudfront\.net$",
        headers: &[
            HeaderRule::Present("x-amz-cf-id"),
            HeaderRule::Present("x-amz-cf-pop"),
            HeaderRule::Contains("via", "cloudfront"),
        ],
    },
    Fingerprint {
        provider: "Akamai",
        cname: r"\.(akamaiedge|akamai|akamaitechnologies|edgekey|edgesuite)\.net$",
        headers: &[
            HeaderRule::Present("x-akamai-request-id"),
            HeaderRule::Present("akamai-grn"),
            HeaderRule::Contains("server", "akamaighost"),
        ],
    },
    Fingerprint {
        provider: "Fastly",
        cname: r"\.fastly(lb)?\.net$",
        headers: &[
            HeaderRule::Present("x-fastly-request-id"),
            HeaderRule::Present("fastly-io-info"),
        ],
    },
    Fingerprint {
        provider: "Azure Front Door",
        cname: r"\.(azurefd|azureedge)\.net$",
        headers: &[
            HeaderRule::Present("x-azure-ref"),
            HeaderRule::Present("x-fd-healthprobe"),
        ],
    },
    Fingerprint {
        provider: "Imperva Incapsula",
        cname: r"\.incapdns\.net$|\.impervadns\.net$",
        headers: &[
            HeaderRule::Present("x-iinfo"),
            HeaderRule::Contains("x-cdn", "incapsula"),
        ],
    },
    Fingerprint {
        provider: "Sucuri",
        cname: r"\.sucuri\.net$",
        headers: &[
            HeaderRule::Present("x-sucuri-id"),
            HeaderRule::Present("x-sucuri-cache"),
        ],
    },
    Fingerprint {
        provider: "StackPath",
        cname: r"\.(stackpathdns|stackpathcdn)\.com$",
        headers: &[
            HeaderRule::Present("x-sp-cache-status"),
            HeaderRule::Present("x-sp-server"),
        ],
    },
];

/// Compiled fingerprint table.
pub struct Fingerprints {
    cname: Vec<(&'static str, Regex)>,
}

impl Fingerprints {
    pub fn new() -> Result<Self, regex::Error> {
        let cname = FINGERPRINTS
            .iter()
            .map(|fp| Ok((fp.provider, Regex::new(&format!("(?i){}", fp.cname))?)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { cname })
    }

    /// Match one CNAME record (trailing dot tolerated).
    pub fn match_cname(&self, record: &str) -> Option<DefenseSignal> {
        let name = record.trim().trim_end_matches('.');
        self.cname
            .iter()
            .find(|(_, re)| re.is_match(name))
            .map(|(provider, _)| DefenseSignal {
                provider: provider.to_string(),
                source: SignalSource::Cname(name.to_string()),
            })
    }

    /// Match response headers against the fingerprint table.
    pub fn match_headers(&self, headers: &HeaderMap) -> Option<DefenseSignal> {
        for fp in FINGERPRINTS {
            for rule in fp.headers {
                let hit = match rule {
                    HeaderRule::Present(name) => headers.contains_key(*name).then_some(*name),
                    HeaderRule::Contains(name, needle) => headers
                        .get(*name)
                        .and_then(|v| v.to_str().ok())
                        .filter(|v| v.to_lowercase().contains(needle))
                        .map(|_| *name),
                };
                if let Some(name) = hit {
                    return Some(DefenseSignal {
                        provider: fp.provider.to_string(),
                        source: SignalSource::Header(name.to_string()),
                    });
                }
            }
        }
        None
    }
}

/// Source of defensive signals for a target.
#[async_trait]
pub trait DefenseProbe: Send + Sync {
    /// Any outbound request must go through `throttle`.
    async fn probe(&self, target: &str, throttle: &ThrottleController) -> Option<DefenseSignal>;
}

/// Probes with `dig` for the CNAME chain, then one HTTPS (or HTTP) request.
pub struct NetworkProbe {
    fingerprints: Fingerprints,
    client: reqwest::Client,
    resolver: String,
}

impl NetworkProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(3))
            .user_agent(concat!("reconflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            fingerprints: Fingerprints::new()?,
            client,
            resolver: "dig".to_string(),
        })
    }

    async fn cname_chain(&self, target: &str) -> Vec<String> {
        let output = Command::new(&self.resolver)
            .args(["+short", "CNAME", target])
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect(),
            Ok(out) => {
                debug!(status = ?out.status.code(), "CNAME lookup failed");
                Vec::new()
            }
            Err(e) => {
                debug!(resolver = %self.resolver, error = %e, "CNAME lookup unavailable");
                Vec::new()
            }
        }
    }

    async fn response_headers(
        &self,
        target: &str,
        throttle: &ThrottleController,
    ) -> Option<HeaderMap> {
        for scheme in ["https", "http"] {
            let url = format!("{}://{}/", scheme, target);
            throttle.acquire().await;
            match self.client.get(&url).send().await {
                Ok(resp) => {
                    throttle.observe_status(resp.status().as_u16()).await;
                    return Some(resp.headers().clone());
                }
                Err(e) => debug!(url, error = %e, "Probe request failed"),
            }
        }
        None
    }
}

#[async_trait]
impl DefenseProbe for NetworkProbe {
    async fn probe(&self, target: &str, throttle: &ThrottleController) -> Option<DefenseSignal> {
        for record in self.cname_chain(target).await {
            if let Some(signal) = self.fingerprints.match_cname(&record) {
                info!(provider = %signal.provider, source = %signal.source, "Defensive signal");
                return Some(signal);
            }
        }
        let headers = self.response_headers(target, throttle).await?;
        let signal = self.fingerprints.match_headers(&headers)?;
        info!(provider = %signal.provider, source = %signal.source, "Defensive signal");
        Some(signal)
    }
}

/// A probe that never reports anything. Used with `--no-probe`.
pub struct NoProbe;

#[async_trait]
impl DefenseProbe for NoProbe {
    async fn probe(&self, _target: &str, _throttle: &ThrottleController) -> Option<DefenseSignal> {
        None
    }
}
