//! Networked backend against etcd's v3 JSON gateway.
//!
//! The gateway exposes the gRPC API over plain HTTP: unary calls are JSON
//! POSTs (`/v3/kv/range`, `/v3/kv/txn`, `/v3/lease/*`), watches stream
//! newline-delimited JSON frames from `/v3/watch`. Keys and values travel
//! base64-encoded; protobuf int64 fields arrive as decimal strings and
//! default-valued fields may be omitted entirely.
//!
//! The public interface is blocking. A small tokio runtime owned by the
//! backend drives the HTTP client, one background task per watch
//! subscription, and one keep-alive task per lease.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use crate::error::{CResult, Error};
use crate::keys;

use super::{
    Backend, DbRevision, DeleteOptions, Lease, Predicate, Recurse, StagedOp, Subscription,
    WatchEvent, WatchQueue, WatchSignal,
};

/// Interval between lease refreshes is `ttl / LEASE_REFRESH_FRACTION`.
const LEASE_REFRESH_FRACTION: u64 = 4;

/// How long to back off before re-establishing a broken watch stream.
const WATCH_RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Per-request timeout for fire-and-forget lease traffic.
const LEASE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection options for the networked backend.
#[derive(Clone, Debug)]
pub struct Etcd3Options {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    /// Path to a PEM CA certificate for HTTPS endpoints.
    pub cert: Option<std::path::PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for Etcd3Options {
    fn default() -> Self {
        Etcd3Options {
            host: "127.0.0.1".to_owned(),
            port: 2379,
            protocol: "http".to_owned(),
            cert: None,
            username: None,
            password: None,
        }
    }
}

/// Shared request context: everything a background task needs, deliberately
/// excluding the runtime so tasks never end up dropping it.
struct EtcdCtx {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl EtcdCtx {
    fn post(&self, endpoint: &str) -> reqwest::RequestBuilder {
        let mut request = self.http.post(format!("{}{}", self.base, endpoint));
        if let Some(token) = &self.token {
            request = request.header("Authorization", token.clone());
        }
        request
    }
}

struct Etcd3Inner {
    rt: Runtime,
    ctx: Arc<EtcdCtx>,
}

impl Etcd3Inner {
    fn call<B: Serialize, R: DeserializeOwned>(&self, endpoint: &str, body: &B) -> CResult<R> {
        self.rt.block_on(async {
            let response = self.ctx.post(endpoint).json(body).send().await?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(Error::Backend(format!("etcd gateway returned {status}: {text}")));
            }
            Ok(response.json::<R>().await?)
        })
    }
}

/// Highly consistent database backend store, see <https://github.com/etcd-io/etcd>.
#[derive(Clone)]
pub struct Etcd3Backend {
    inner: Arc<Etcd3Inner>,
}

impl Etcd3Backend {
    /// Connect to the database. Credentials, if any, are exchanged for a
    /// gateway token up front.
    pub fn connect(options: &Etcd3Options) -> CResult<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("sdp-config-etcd3")
            .enable_all()
            .build()?;

        let mut builder = reqwest::Client::builder();
        if let Some(cert) = &options.cert {
            let pem = std::fs::read(cert)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        let http = builder.build()?;
        let base = format!("{}://{}:{}", options.protocol, options.host, options.port);

        let token = match (&options.username, &options.password) {
            (Some(name), Some(password)) => {
                let request =
                    wire::AuthenticateRequest { name: name.clone(), password: password.clone() };
                let response: wire::AuthenticateResponse = rt.block_on(async {
                    let response = http
                        .post(format!("{base}/v3/auth/authenticate"))
                        .json(&request)
                        .send()
                        .await?
                        .error_for_status()?;
                    Ok::<_, Error>(response.json().await?)
                })?;
                Some(response.token)
            }
            _ => None,
        };

        log::debug!("connected to etcd gateway at {base}");
        let ctx = Arc::new(EtcdCtx { http, base, token });
        Ok(Etcd3Backend { inner: Arc::new(Etcd3Inner { rt, ctx }) })
    }

    fn kv_txn(&self, request: &wire::TxnRequest) -> CResult<wire::TxnResponse> {
        self.inner.call("/v3/kv/txn", request)
    }
}

impl Backend for Etcd3Backend {
    fn get(&self, path: &str, revision: Option<i64>) -> CResult<(Option<String>, DbRevision)> {
        keys::check_path(path)?;
        let tagged = keys::tag_depth(path, None)?;
        let request = wire::RangeRequest {
            key: b64(&tagged),
            range_end: None,
            revision,
            keys_only: None,
        };
        let response: wire::RangeResponse = self.inner.call("/v3/kv/range", &request)?;

        let mut value = None;
        let mut mod_revision = None;
        if let Some(kv) = response.kvs.first() {
            value = Some(utf8(&kv.value)?);
            mod_revision = Some(kv.mod_revision);
        }
        Ok((value, DbRevision { revision: response.header.revision, mod_revision }))
    }

    fn list_keys(
        &self,
        path: &str,
        recurse: &Recurse,
        revision: Option<i64>,
    ) -> CResult<(Vec<String>, DbRevision)> {
        keys::check_path_prefix(path)?;
        let base_depth = keys::depth_of(path);

        // One range request per level, bundled into a single read-only
        // transaction so all levels come from the same snapshot.
        let mut success = Vec::new();
        for level in recurse.levels() {
            let tagged = keys::tag_depth(path, Some(base_depth + level))?;
            success.push(wire::RequestOp {
                request_range: Some(wire::RangeRequest {
                    key: b64(&tagged),
                    range_end: Some(b64_bytes(&prefix_range_end(tagged.as_bytes()))),
                    revision,
                    keys_only: Some(true),
                }),
                ..wire::RequestOp::default()
            });
        }
        let response = self.kv_txn(&wire::TxnRequest { success, ..wire::TxnRequest::default() })?;

        let mut result = Vec::new();
        for op in &response.responses {
            if let Some(range) = &op.response_range {
                for kv in &range.kvs {
                    result.push(keys::untag_depth(&utf8(&kv.key)?)?);
                }
            }
        }
        result.sort();
        Ok((result, DbRevision { revision: response.header.revision, mod_revision: None }))
    }

    fn create(&self, path: &str, value: &str, lease: Option<&Lease>) -> CResult<()> {
        keys::check_path(path)?;
        let tagged = keys::tag_depth(path, None)?;
        let request = wire::TxnRequest {
            compare: vec![wire::Compare::version(&tagged, "EQUAL", 0)],
            success: vec![wire::RequestOp::put(&tagged, value, lease.map(Lease::id))],
            ..wire::TxnRequest::default()
        };
        match self.kv_txn(&request)?.succeeded {
            true => Ok(()),
            false => Err(Error::collision(path)),
        }
    }

    fn update(&self, path: &str, value: &str, must_be_rev: Option<i64>) -> CResult<()> {
        keys::check_path(path)?;
        let tagged = keys::tag_depth(path, None)?;
        let mut compare = vec![wire::Compare::version(&tagged, "GREATER", 0)];
        if let Some(mod_revision) = must_be_rev {
            compare.push(wire::Compare::mod_revision(&tagged, "EQUAL", mod_revision));
        }
        let request = wire::TxnRequest {
            compare,
            success: vec![wire::RequestOp::put(&tagged, value, None)],
            ..wire::TxnRequest::default()
        };
        match self.kv_txn(&request)?.succeeded {
            true => Ok(()),
            false => Err(Error::vanished(path)),
        }
    }

    fn delete(&self, path: &str, options: &DeleteOptions) -> CResult<()> {
        if options.prefix {
            keys::check_path_prefix(path)?;
        } else {
            keys::check_path(path)?;
        }
        let tagged = keys::tag_depth(path, None)?;

        let mut compare = Vec::new();
        if options.must_exist {
            compare.push(wire::Compare::version(&tagged, "GREATER", 0));
        }
        let mut success = vec![wire::RequestOp::delete(
            &tagged,
            options.prefix.then(|| prefix_range_end(tagged.as_bytes())),
        )];

        // Recursion is flattened into one prefix delete per level below the
        // path, all within the same atomic request.
        if options.recursive {
            let base_depth = keys::depth_of(path);
            let child_prefix =
                if options.prefix { path.to_owned() } else { format!("{}/", path) };
            for level in base_depth + 1..=base_depth + options.max_depth {
                let level_tag = keys::tag_depth(&child_prefix, Some(level))?;
                success.push(wire::RequestOp::delete(
                    &level_tag,
                    Some(prefix_range_end(level_tag.as_bytes())),
                ));
            }
        }

        let request = wire::TxnRequest { compare, success, ..wire::TxnRequest::default() };
        match self.kv_txn(&request)?.succeeded {
            true => Ok(()),
            false => Err(Error::vanished(path)),
        }
    }

    fn watch(
        &self,
        path: &str,
        prefix: bool,
        revision: Option<i64>,
        depth: Option<usize>,
    ) -> CResult<Box<dyn Subscription>> {
        if !prefix {
            keys::check_path(path)?;
        }
        Ok(Box::new(Etcd3Subscription {
            inner: self.inner.clone(),
            tagged: keys::tag_depth(path, depth)?,
            prefix,
            start_revision: revision,
            task: None,
        }))
    }

    fn lease(&self, ttl: u64) -> CResult<Lease> {
        let request = wire::LeaseGrantRequest { ttl: ttl as i64 };
        let response: wire::LeaseGrantResponse = self.inner.call("/v3/lease/grant", &request)?;
        let id = response.id;

        // The server only keeps the lease while it is refreshed; do so in the
        // background for as long as the handle is held.
        let ctx = self.inner.ctx.clone();
        let keeper = self.inner.rt.spawn(keep_alive_task(ctx, id, ttl));
        log::debug!("granted lease {id} with ttl {ttl}s");

        let guard = LeaseGuard { inner: self.inner.clone(), id, keeper };
        Ok(Lease::new(id, Some(Box::new(guard))))
    }

    fn commit(&self, predicates: &[Predicate], ops: &[StagedOp]) -> CResult<bool> {
        let mut compare = Vec::with_capacity(predicates.len());
        for predicate in predicates {
            compare.push(match predicate {
                Predicate::Absent { path } => {
                    wire::Compare::version(&keys::tag_depth(path, None)?, "EQUAL", 0)
                }
                Predicate::Exists { path } => {
                    wire::Compare::version(&keys::tag_depth(path, None)?, "GREATER", 0)
                }
                Predicate::ModRevisionIs { path, mod_revision } => {
                    wire::Compare::mod_revision(&keys::tag_depth(path, None)?, "EQUAL", *mod_revision)
                }
                Predicate::NoCreatedSince { path, depth, revision } => {
                    let tagged = keys::tag_depth(path, Some(*depth))?;
                    wire::Compare::create_range(&tagged, "LESS", revision + 1)
                }
            });
        }

        let mut success = Vec::with_capacity(ops.len());
        for op in ops {
            success.push(match op {
                StagedOp::Put { path, value, lease } => {
                    wire::RequestOp::put(&keys::tag_depth(path, None)?, value, *lease)
                }
                StagedOp::Delete { path } => {
                    wire::RequestOp::delete(&keys::tag_depth(path, None)?, None)
                }
            });
        }

        let request = wire::TxnRequest { compare, success, ..wire::TxnRequest::default() };
        let response = self.kv_txn(&request)?;
        Ok(response.succeeded)
    }

    fn close(&self) {
        // Connections are pooled by the HTTP client; nothing to tear down
        // until the last handle is dropped.
    }
}

/// Keeps a lease alive and revokes it when dropped.
struct LeaseGuard {
    inner: Arc<Etcd3Inner>,
    id: i64,
    keeper: JoinHandle<()>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.keeper.abort();
        let ctx = self.inner.ctx.clone();
        let id = self.id;
        // Best-effort revoke so leased keys clear promptly on scope exit;
        // expiry covers the case where this never lands.
        self.inner.rt.spawn(async move {
            let request = wire::LeaseRevokeRequest { id };
            let result = ctx
                .post("/v3/lease/revoke")
                .json(&request)
                .timeout(LEASE_REQUEST_TIMEOUT)
                .send()
                .await;
            if let Err(err) = result {
                log::debug!("lease {id} revoke failed: {err}");
            }
        });
    }
}

async fn keep_alive_task(ctx: Arc<EtcdCtx>, id: i64, ttl: u64) {
    let period = Duration::from_secs((ttl / LEASE_REFRESH_FRACTION).max(1));
    loop {
        tokio::time::sleep(period).await;
        let request = wire::LeaseKeepAliveRequest { id };
        let result = ctx
            .post("/v3/lease/keepalive")
            .json(&request)
            .timeout(LEASE_REQUEST_TIMEOUT)
            .send()
            .await;
        match result {
            // The keep-alive endpoint streams; the first frame acknowledges
            // the refresh and the connection is dropped with the response.
            Ok(response) => {
                let _ = response;
            }
            Err(err) => log::warn!("lease {id} keep-alive failed: {err}"),
        }
    }
}

/// A single streaming watch against the gateway.
struct Etcd3Subscription {
    inner: Arc<Etcd3Inner>,
    tagged: String,
    prefix: bool,
    start_revision: Option<i64>,
    task: Option<JoinHandle<()>>,
}

impl Subscription for Etcd3Subscription {
    fn start(&mut self, queue: WatchQueue) -> CResult<()> {
        if self.task.is_some() {
            return Ok(());
        }
        let ctx = self.inner.ctx.clone();
        let tagged = self.tagged.clone();
        let prefix = self.prefix;
        let start_revision = self.start_revision;
        self.task = Some(self.inner.rt.spawn(watch_task(ctx, tagged, prefix, start_revision, queue)));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Etcd3Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn watch_task(
    ctx: Arc<EtcdCtx>,
    tagged: String,
    prefix: bool,
    mut start_revision: Option<i64>,
    queue: WatchQueue,
) {
    loop {
        let request = wire::WatchRequest {
            create_request: wire::WatchCreateRequest {
                key: b64(&tagged),
                range_end: prefix.then(|| b64_bytes(&prefix_range_end(tagged.as_bytes()))),
                start_revision,
            },
        };
        let response = match ctx.post("/v3/watch").json(&request).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                log::warn!("watch on {tagged} rejected: {}", response.status());
                tokio::time::sleep(WATCH_RECONNECT_DELAY).await;
                continue;
            }
            Err(err) => {
                log::warn!("watch on {tagged} failed to connect: {err}");
                tokio::time::sleep(WATCH_RECONNECT_DELAY).await;
                continue;
            }
        };

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        'stream: while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    log::debug!("watch stream on {tagged} broke: {err}");
                    break;
                }
            };
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let frame: wire::WatchFrame = match serde_json::from_slice(&line) {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::debug!("undecodable watch frame on {tagged}: {err}");
                        continue;
                    }
                };
                let Some(result) = frame.result else { continue };
                if result.header.revision > 0 {
                    // Resume point if the stream is lost.
                    start_revision = Some(result.header.revision + 1);
                }
                for event in result.events {
                    let Some(kv) = event.kv else { continue };
                    let Ok(path) = utf8(&kv.key).and_then(|k| keys::untag_depth(&k)) else {
                        continue;
                    };
                    let value = match event.kind.as_str() {
                        "DELETE" => None,
                        _ => Some(utf8(&kv.value).unwrap_or_default()),
                    };
                    let signal = WatchSignal::Event(WatchEvent {
                        path,
                        value,
                        revision: DbRevision {
                            revision: kv.mod_revision,
                            mod_revision: Some(kv.mod_revision),
                        },
                    });
                    if queue.send(signal).is_err() {
                        // Consumer is gone; the subscription dies with it.
                        return;
                    }
                }
                if result.canceled {
                    break 'stream;
                }
            }
        }
        tokio::time::sleep(WATCH_RECONNECT_DELAY).await;
        log::debug!("re-establishing watch on {tagged}");
    }
}

fn b64(s: &str) -> String {
    b64_bytes(s.as_bytes())
}

fn b64_bytes(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn utf8(bytes: &[u8]) -> CResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Backend("store returned a non-UTF-8 key or value".to_owned()))
}

/// The first key past every key with the given prefix, for `range_end`.
fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    match prefix.iter().rposition(|b| *b != 0xff) {
        Some(i) => {
            prefix.iter().take(i).copied().chain(std::iter::once(prefix[i] + 1)).collect()
        }
        None => vec![0],
    }
}

/// Gateway request/response bodies. Int64 fields are decoded from either
/// JSON numbers or protobuf-JSON decimal strings; missing fields decode as
/// protobuf defaults.
mod wire {
    use serde::{Deserialize, Deserializer, Serialize};

    pub fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        struct NumOrStr;
        impl serde::de::Visitor<'_> for NumOrStr {
            type Value = i64;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "an integer or a protobuf int64 string")
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<i64, E> {
                Ok(v)
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<i64, E> {
                i64::try_from(v).map_err(E::custom)
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<i64, E> {
                v.parse().map_err(E::custom)
            }
        }
        deserializer.deserialize_any(NumOrStr)
    }

    pub fn de_b64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        use base64::Engine as _;
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct ResponseHeader {
        #[serde(default, deserialize_with = "de_i64")]
        pub revision: i64,
    }

    #[derive(Debug, Deserialize)]
    pub struct KeyValue {
        #[serde(default, deserialize_with = "de_b64")]
        pub key: Vec<u8>,
        #[serde(default, deserialize_with = "de_b64")]
        pub value: Vec<u8>,
        #[serde(default, alias = "createRevision", deserialize_with = "de_i64")]
        pub create_revision: i64,
        #[serde(default, alias = "modRevision", deserialize_with = "de_i64")]
        pub mod_revision: i64,
        #[serde(default, deserialize_with = "de_i64")]
        pub version: i64,
    }

    #[derive(Debug, Serialize)]
    pub struct RangeRequest {
        pub key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub range_end: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub revision: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub keys_only: Option<bool>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct RangeResponse {
        #[serde(default)]
        pub header: ResponseHeader,
        #[serde(default)]
        pub kvs: Vec<KeyValue>,
    }

    #[derive(Debug, Serialize)]
    pub struct Compare {
        pub key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub range_end: Option<String>,
        pub target: &'static str,
        pub result: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub version: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub mod_revision: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub create_revision: Option<i64>,
    }

    impl Compare {
        fn new(tagged: &str, target: &'static str, result: &'static str) -> Compare {
            Compare {
                key: super::b64(tagged),
                range_end: None,
                target,
                result,
                version: None,
                mod_revision: None,
                create_revision: None,
            }
        }

        pub fn version(tagged: &str, result: &'static str, version: i64) -> Compare {
            Compare { version: Some(version), ..Compare::new(tagged, "VERSION", result) }
        }

        pub fn mod_revision(tagged: &str, result: &'static str, mod_revision: i64) -> Compare {
            Compare { mod_revision: Some(mod_revision), ..Compare::new(tagged, "MOD", result) }
        }

        /// Compare the create revision of every key in the tagged prefix
        /// range.
        pub fn create_range(tagged: &str, result: &'static str, create_revision: i64) -> Compare {
            Compare {
                range_end: Some(super::b64_bytes(&super::prefix_range_end(tagged.as_bytes()))),
                create_revision: Some(create_revision),
                ..Compare::new(tagged, "CREATE", result)
            }
        }
    }

    #[derive(Debug, Serialize)]
    pub struct PutRequest {
        pub key: String,
        pub value: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub lease: Option<i64>,
    }

    #[derive(Debug, Serialize)]
    pub struct DeleteRangeRequest {
        pub key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub range_end: Option<String>,
    }

    #[derive(Debug, Default, Serialize)]
    pub struct RequestOp {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub request_range: Option<RangeRequest>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub request_put: Option<PutRequest>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub request_delete_range: Option<DeleteRangeRequest>,
    }

    impl RequestOp {
        pub fn put(tagged: &str, value: &str, lease: Option<i64>) -> RequestOp {
            RequestOp {
                request_put: Some(PutRequest {
                    key: super::b64(tagged),
                    value: super::b64(value),
                    lease,
                }),
                ..RequestOp::default()
            }
        }

        pub fn delete(tagged: &str, range_end: Option<Vec<u8>>) -> RequestOp {
            RequestOp {
                request_delete_range: Some(DeleteRangeRequest {
                    key: super::b64(tagged),
                    range_end: range_end.map(|end| super::b64_bytes(&end)),
                }),
                ..RequestOp::default()
            }
        }
    }

    #[derive(Debug, Default, Serialize)]
    pub struct TxnRequest {
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub compare: Vec<Compare>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub success: Vec<RequestOp>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        pub failure: Vec<RequestOp>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct ResponseOp {
        #[serde(default, alias = "responseRange")]
        pub response_range: Option<RangeResponse>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct TxnResponse {
        #[serde(default)]
        pub header: ResponseHeader,
        #[serde(default)]
        pub succeeded: bool,
        #[serde(default)]
        pub responses: Vec<ResponseOp>,
    }

    #[derive(Debug, Serialize)]
    pub struct LeaseGrantRequest {
        #[serde(rename = "TTL")]
        pub ttl: i64,
    }

    #[derive(Debug, Deserialize)]
    pub struct LeaseGrantResponse {
        #[serde(rename = "ID", default, deserialize_with = "de_i64")]
        pub id: i64,
    }

    #[derive(Debug, Serialize)]
    pub struct LeaseRevokeRequest {
        #[serde(rename = "ID")]
        pub id: i64,
    }

    #[derive(Debug, Serialize)]
    pub struct LeaseKeepAliveRequest {
        #[serde(rename = "ID")]
        pub id: i64,
    }

    #[derive(Debug, Serialize)]
    pub struct WatchCreateRequest {
        pub key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub range_end: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub start_revision: Option<i64>,
    }

    #[derive(Debug, Serialize)]
    pub struct WatchRequest {
        pub create_request: WatchCreateRequest,
    }

    #[derive(Debug, Deserialize)]
    pub struct WatchJsonEvent {
        /// "PUT" is the protobuf default and usually omitted on the wire.
        #[serde(default, rename = "type")]
        pub kind: String,
        pub kv: Option<KeyValue>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct WatchResult {
        #[serde(default)]
        pub header: ResponseHeader,
        #[serde(default)]
        pub events: Vec<WatchJsonEvent>,
        #[serde(default)]
        pub canceled: bool,
    }

    #[derive(Debug, Deserialize)]
    pub struct WatchFrame {
        pub result: Option<WatchResult>,
    }

    #[derive(Debug, Serialize)]
    pub struct AuthenticateRequest {
        pub name: String,
        pub password: String,
    }

    #[derive(Debug, Deserialize)]
    pub struct AuthenticateResponse {
        #[serde(default)]
        pub token: String,
    }
}
