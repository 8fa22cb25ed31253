use std::io::Read;
use std::time::Duration;

use crate::cancel::Context;
use crate::error::{Error, Result};
use crate::registry::{Descriptor, Registry};

const USER_AGENT: &str = concat!("ocicache/", env!("CARGO_PKG_VERSION"));

/// Backoff schedule for transient registry failures: a short fixed list of sleeps rather
/// than a general exponential-backoff crate, since registries are well-behaved enough that
/// three attempts covers it.
const RETRY_SLEEPS: &[Duration] = &[Duration::from_millis(100), Duration::from_millis(400)];

fn is_retryable_status(status: u16) -> bool {
    status == 429 || status == 502 || status == 503 || status == 504
}

fn call_with_retry<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut last_err = None;
    for sleep in RETRY_SLEEPS.iter().chain(std::iter::once(&Duration::ZERO)) {
        match f() {
            Ok(v) => return Ok(v),
            Err(Error::Registry(msg)) if retryable_message(&msg) => {
                last_err = Some(Error::Registry(msg));
                if !sleep.is_zero() {
                    std::thread::sleep(*sleep);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or(Error::Registry("retry loop exhausted".into())))
}

fn retryable_message(msg: &str) -> bool {
    RETRYABLE_STATUS_CODES
        .iter()
        .any(|code| msg.contains(&code.to_string()))
}

const RETRYABLE_STATUS_CODES: &[u16] = &[429, 502, 503, 504];

/// A `Registry` backed by plain HTTP range requests, using a blocking `ureq` client with
/// no connection-pooling tuning beyond the defaults. Range support is probed by response
/// status rather than an out-of-band capability flag.
///
/// Reference and repository resolution (turning an image reference into a pull URL) is the
/// push/pull client's job; this collaborator only ever receives URLs it can GET directly.
pub struct HttpRegistry {
    agent: ureq::Agent,
}

impl HttpRegistry {
    pub fn new() -> HttpRegistry {
        let agent = ureq::AgentBuilder::new()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build();
        HttpRegistry { agent }
    }

    fn get(&self, ctx: &Context, url: &str, range: Option<(u64, u64)>) -> Result<ureq::Response> {
        ctx.check()?;
        let mut req = self.agent.get(url);
        if let Some((offset, length)) = range {
            let end = offset + length.saturating_sub(1);
            req = req.set("Range", &format!("bytes={offset}-{end}"));
        }
        call_with_retry(|| {
            req.clone().call().map_err(|e| match &e {
                ureq::Error::Status(404, _) => Error::NotFound,
                ureq::Error::Status(401, _) | ureq::Error::Status(403, _) => Error::Unauthorized,
                ureq::Error::Status(416, _) => Error::RangeNotSupported,
                ureq::Error::Status(code, _) => Error::Registry(format!("http {code}")),
                ureq::Error::Transport(t) => Error::Registry(t.to_string()),
            })
        })
    }
}

impl Default for HttpRegistry {
    fn default() -> HttpRegistry {
        HttpRegistry::new()
    }
}

impl Registry for HttpRegistry {
    fn fetch_blob(
        &self,
        ctx: &Context,
        reference: &str,
        _desc: &Descriptor,
    ) -> Result<Box<dyn Read + Send>> {
        let resp = self.get(ctx, reference, None)?;
        Ok(Box::new(resp.into_reader()))
    }

    fn fetch_blob_range(
        &self,
        ctx: &Context,
        reference: &str,
        _desc: &Descriptor,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn Read + Send>> {
        let resp = self.get(ctx, reference, Some((offset, length)))?;
        if resp.status() != 206 {
            return Err(Error::RangeNotSupported);
        }
        Ok(Box::new(resp.into_reader()))
    }

    fn list_tags(&self, ctx: &Context, repository: &str) -> Result<Vec<String>> {
        let mut url = url::Url::parse(repository)
            .map_err(|e| Error::InvalidRef(format!("{repository}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| Error::InvalidRef(format!("{repository}: cannot be a base")))?
            .pop_if_empty()
            .extend(["tags", "list"]);
        let resp = self.get(ctx, url.as_str(), None)?;
        #[derive(serde::Deserialize)]
        struct TagsResponse {
            tags: Vec<String>,
        }
        let body: TagsResponse = resp.into_json().map_err(|e| Error::Registry(e.to_string()))?;
        Ok(body.tags)
    }
}
