//! S3-compatible adapter with simulated directories.
//!
//! Talks to AWS S3, MinIO, R2 and friends through reqwest with hand-rolled
//! AWS Signature Version 4 — no SDK. S3 has no directories, so the adapter
//! fakes them: listing uses `Delimiter=/` and reports CommonPrefixes as dir
//! entries, mkdir drops a zero-byte `<key>/` placeholder, and delete/copy
//! enumerate every key under `<key>/`.
//!
//! CommonPrefixes carry no timestamp, so simulated directories report the
//! current time as their mtime.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Method, StatusCode};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::paths;
use crate::s3config::S3ConfigProfile;

use super::{paginate, Entry, EntryKind, ListPage, StorageAdapter};

const DEFAULT_LIST_KEYS: usize = 1000;

static KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<Key>([^<]+)</Key>").unwrap());
static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<NextContinuationToken>([^<]+)</NextContinuationToken>").unwrap());
static PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<CommonPrefixes>\s*<Prefix>([^<]+)</Prefix>\s*</CommonPrefixes>").unwrap()
});
static CONTENTS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<Contents>(.*?)</Contents>").unwrap());
static SIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<Size>(\d+)</Size>").unwrap());
static MODIFIED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<LastModified>([^<]+)</LastModified>").unwrap());
static MESSAGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<Message>([^<]+)</Message>").unwrap());

#[derive(Debug)]
pub struct S3Adapter {
    profile: S3ConfigProfile,
    client: Client,
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    use hmac::{Hmac, Mac};
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Percent-encode each path segment, leaving `/` as the separator.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn leaf_of(key: &str) -> &str {
    key.trim_end_matches('/').rsplit('/').next().unwrap_or(key)
}

fn parse_iso8601_ms(raw: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl S3Adapter {
    pub fn new(profile: S3ConfigProfile) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AppError::upstream(format!("building S3 client: {e}")))?;
        Ok(Self { profile, client })
    }

    pub fn profile(&self) -> &S3ConfigProfile {
        &self.profile
    }

    /// Downloads are mediated by the service; the public URL points back at
    /// our own endpoint, never at a pre-signed bucket URL.
    pub fn public_url(&self, virtual_path: &str) -> String {
        format!(
            "/api/s3/download?configId={}&path={}",
            urlencoding::encode(&self.profile.id),
            urlencoding::encode(virtual_path)
        )
    }

    fn endpoint(&self) -> String {
        match &self.profile.endpoint {
            Some(ep) => ep.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", self.profile.region),
        }
    }

    /// Custom endpoints (MinIO and friends) get path-style addressing; bare
    /// AWS gets virtual-hosted style.
    fn build_url(&self, key: &str) -> String {
        let endpoint = self.endpoint();
        let encoded = encode_key(key);
        if self.profile.endpoint.is_some() {
            if encoded.is_empty() {
                format!("{}/{}", endpoint, self.profile.bucket)
            } else {
                format!("{}/{}/{}", endpoint, self.profile.bucket, encoded)
            }
        } else {
            let host = endpoint.replace("https://", "").replace("http://", "");
            if encoded.is_empty() {
                format!("https://{}.{}", self.profile.bucket, host)
            } else {
                format!("https://{}.{}/{}", self.profile.bucket, host, encoded)
            }
        }
    }

    /// Map a virtual path onto a storage key, applying the profile prefix.
    /// `/` maps to the bare prefix (possibly the empty key).
    fn key_for(&self, virtual_path: &str) -> AppResult<String> {
        let normalized = paths::normalize(virtual_path)?;
        let clean = normalized.trim_matches('/');
        let prefix = self.profile.prefix.as_deref().unwrap_or("").trim_matches('/');
        Ok(match (prefix.is_empty(), clean.is_empty()) {
            (true, _) => clean.to_string(),
            (false, true) => prefix.to_string(),
            (false, false) => format!("{prefix}/{clean}"),
        })
    }

    fn sign_request(
        &self,
        method: &str,
        url: &str,
        headers: &mut HashMap<String, String>,
        payload_hash: &str,
    ) -> AppResult<String> {
        let now = chrono::Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        headers.insert("x-amz-date".to_string(), amz_date.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());

        let parsed = url::Url::parse(url).map_err(|e| AppError::upstream(e.to_string()))?;
        let host = parsed.host_str().unwrap_or("").to_string();
        let host = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };
        headers.insert("host".to_string(), host);

        // Query parameters sorted by key then value for the canonical form.
        let canonical_query = {
            let mut params: Vec<(String, String)> = parsed
                .query_pairs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            params.sort();
            params
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&")
        };

        let mut signed_headers: Vec<&str> = headers.keys().map(|s| s.as_str()).collect();
        signed_headers.sort();
        let signed_headers_str = signed_headers.join(";");
        let mut canonical_headers = String::new();
        for name in &signed_headers {
            if let Some(value) = headers.get(*name) {
                canonical_headers.push_str(&format!("{}:{}\n", name.to_lowercase(), value.trim()));
            }
        }

        let canonical_path = if parsed.path().is_empty() { "/" } else { parsed.path() };
        let canonical_request = format!(
            "{method}\n{canonical_path}\n{canonical_query}\n{canonical_headers}\n{signed_headers_str}\n{payload_hash}"
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.profile.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let k_date = hmac_sha256(
            format!("AWS4{}", self.profile.secret_access_key).as_bytes(),
            date_stamp.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.profile.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        Ok(format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers_str}, Signature={signature}",
            self.profile.access_key_id
        ))
    }

    async fn s3_request(
        &self,
        method: Method,
        key: &str,
        query: &[(&str, &str)],
        body: Option<Vec<u8>>,
        extra_headers: &[(&str, String)],
    ) -> AppResult<reqwest::Response> {
        let mut url = self.build_url(key);
        if !query.is_empty() {
            let qs = query
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url = format!("{url}?{qs}");
        }

        let payload = body.as_deref().unwrap_or(&[]);
        let payload_hash = sha256_hex(payload);

        let mut headers = HashMap::new();
        for (name, value) in extra_headers {
            headers.insert(name.to_string(), value.clone());
        }
        let authorization = self.sign_request(method.as_str(), &url, &mut headers, &payload_hash)?;

        let mut request = self.client.request(method, &url);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = request.header("Authorization", authorization);
        if let Some(bytes) = body {
            // Some S3-compatible services require an explicit length even
            // for empty bodies.
            request = request.header("Content-Length", bytes.len().to_string());
            request = request.body(bytes);
        }

        request
            .send()
            .await
            .map_err(|e| AppError::upstream(format!("S3 request failed: {e}")))
    }

    /// All object keys under `prefix`, following continuation tokens.
    async fn list_keys_with_prefix(&self, prefix: &str) -> AppResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query: Vec<(&str, &str)> =
                vec![("list-type", "2"), ("prefix", prefix), ("max-keys", "1000")];
            let token_val;
            if let Some(t) = &token {
                token_val = t.clone();
                query.push(("continuation-token", &token_val));
            }
            let response = self.s3_request(Method::GET, "", &query, None, &[]).await?;
            if response.status() != StatusCode::OK {
                return Err(upstream_from_response(response).await);
            }
            let xml = response
                .text()
                .await
                .map_err(|e| AppError::upstream(e.to_string()))?;
            for cap in KEY_RE.captures_iter(&xml) {
                keys.push(xml_unescape(&cap[1]));
            }
            match TOKEN_RE.captures(&xml) {
                Some(cap) => token = Some(xml_unescape(&cap[1])),
                None => break,
            }
        }
        Ok(keys)
    }

    /// One ListObjectsV2 page parsed into entries. `dir_prefix` is the
    /// listed prefix (`""` or `<key>/`); its own placeholder object is
    /// excluded.
    fn parse_list_page(&self, xml: &str, dir_prefix: &str) -> Vec<Entry> {
        let mut entries = Vec::new();
        for cap in PREFIX_RE.captures_iter(xml) {
            let full = xml_unescape(&cap[1]);
            let name = leaf_of(&full).to_string();
            if name.is_empty() {
                continue;
            }
            entries.push(Entry { name, kind: EntryKind::Dir, size: 0, mtime: now_ms() });
        }

        for cap in CONTENTS_RE.captures_iter(xml) {
            let block = &cap[1];
            let Some(key) = KEY_RE.captures(block).map(|c| xml_unescape(&c[1])) else {
                continue;
            };
            // Directory markers (trailing slash) and the listed prefix's own
            // placeholder are not files.
            if key.ends_with('/') || key == dir_prefix.trim_end_matches('/') {
                continue;
            }
            let name = leaf_of(&key).to_string();
            if name.is_empty() {
                continue;
            }
            let size = SIZE_RE
                .captures(block)
                .and_then(|c| c[1].parse::<u64>().ok())
                .unwrap_or(0);
            let mtime = MODIFIED_RE
                .captures(block)
                .map(|c| parse_iso8601_ms(&c[1]))
                .unwrap_or(0);
            entries.push(Entry { name, kind: EntryKind::File, size, mtime });
        }
        entries
    }

    async fn copy_object(&self, from_key: &str, to_key: &str) -> AppResult<()> {
        let copy_source = format!("/{}/{}", self.profile.bucket, encode_key(from_key));
        let response = self
            .s3_request(
                Method::PUT,
                to_key,
                &[],
                Some(Vec::new()),
                &[("x-amz-copy-source", copy_source)],
            )
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => Err(AppError::not_found("Path not found.")),
            _ => Err(upstream_from_response(response).await),
        }
    }

    async fn head_exists(&self, key: &str) -> AppResult<Option<(u64, i64)>> {
        let response = self.s3_request(Method::HEAD, key, &[], None, &[]).await?;
        match response.status() {
            StatusCode::OK => {
                let size = response
                    .headers()
                    .get("content-length")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                let mtime = response
                    .headers()
                    .get("last-modified")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| chrono::DateTime::parse_from_rfc2822(s).ok())
                    .map(|dt| dt.timestamp_millis())
                    .unwrap_or(0);
                Ok(Some((size, mtime)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(upstream_from_response(response).await),
        }
    }

    /// Connectivity probe used by the admin settings flow: a one-key list.
    pub async fn test_connection(&self) -> AppResult<()> {
        let response = self
            .s3_request(Method::GET, "", &[("list-type", "2"), ("max-keys", "1")], None, &[])
            .await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                Err(AppError::upstream("S3 credentials were rejected.".to_string()))
            }
            StatusCode::NOT_FOUND => Err(AppError::upstream(format!(
                "Bucket '{}' was not found.",
                self.profile.bucket
            ))),
            _ => Err(upstream_from_response(response).await),
        }
    }

    fn guard_copy_keys(&self, src_key: &str, dest_key: &str) -> AppResult<()> {
        let root_key = self.key_for("/")?;
        if src_key == root_key || dest_key == root_key {
            return Err(AppError::invalid_path("The root cannot be moved or copied."));
        }
        if dest_key == src_key || dest_key.starts_with(&format!("{src_key}/")) {
            return Err(AppError::invalid_path("Cannot move a directory into itself."));
        }
        Ok(())
    }
}

async fn upstream_from_response(response: reqwest::Response) -> AppError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail = MESSAGE_RE
        .captures(&body)
        .map(|c| xml_unescape(&c[1]))
        .unwrap_or_else(|| body.chars().take(200).collect());
    AppError::upstream(format!("S3 error ({status}): {detail}"))
}

fn xml_unescape(raw: &str) -> String {
    raw.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
}

#[async_trait]
impl StorageAdapter for S3Adapter {
    async fn list(&self, path: &str, limit: Option<usize>, offset: usize) -> AppResult<ListPage> {
        let key = self.key_for(path)?;
        let dir_prefix = if key.is_empty() { String::new() } else { format!("{key}/") };
        let max_keys = limit.unwrap_or(DEFAULT_LIST_KEYS).to_string();
        let mut query: Vec<(&str, &str)> =
            vec![("list-type", "2"), ("delimiter", "/"), ("max-keys", &max_keys)];
        if !dir_prefix.is_empty() {
            query.push(("prefix", &dir_prefix));
        }
        let response = self.s3_request(Method::GET, "", &query, None, &[]).await?;
        if response.status() != StatusCode::OK {
            return Err(upstream_from_response(response).await);
        }
        let xml = response
            .text()
            .await
            .map_err(|e| AppError::upstream(e.to_string()))?;
        let entries = self.parse_list_page(&xml, &dir_prefix);
        // MaxKeys already bounded the page; only the offset is applied here.
        Ok(paginate(entries, None, offset))
    }

    async fn stat(&self, path: &str) -> AppResult<Option<Entry>> {
        let key = self.key_for(path)?;
        if key == self.key_for("/")? {
            return Ok(Some(Entry {
                name: "/".to_string(),
                kind: EntryKind::Dir,
                size: 0,
                mtime: now_ms(),
            }));
        }
        if let Some((size, mtime)) = self.head_exists(&key).await? {
            return Ok(Some(Entry {
                name: leaf_of(&key).to_string(),
                kind: EntryKind::File,
                size,
                mtime,
            }));
        }
        // No object with that key: any content under `<key>/` makes it a
        // simulated directory.
        let probe = format!("{key}/");
        let response = self
            .s3_request(
                Method::GET,
                "",
                &[("list-type", "2"), ("prefix", &probe), ("max-keys", "1")],
                None,
                &[],
            )
            .await?;
        if response.status() != StatusCode::OK {
            return Err(upstream_from_response(response).await);
        }
        let xml = response
            .text()
            .await
            .map_err(|e| AppError::upstream(e.to_string()))?;
        if xml.contains("<Key>") {
            Ok(Some(Entry {
                name: leaf_of(&key).to_string(),
                kind: EntryKind::Dir,
                size: 0,
                mtime: now_ms(),
            }))
        } else {
            Ok(None)
        }
    }

    async fn read(&self, path: &str) -> AppResult<Vec<u8>> {
        let key = self.key_for(path)?;
        let response = self.s3_request(Method::GET, &key, &[], None, &[]).await?;
        match response.status() {
            StatusCode::OK => Ok(response
                .bytes()
                .await
                .map_err(|e| AppError::upstream(e.to_string()))?
                .to_vec()),
            StatusCode::NOT_FOUND => Err(AppError::not_found("Path not found.")),
            _ => Err(upstream_from_response(response).await),
        }
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> AppResult<()> {
        let key = self.key_for(path)?;
        if key == self.key_for("/")? {
            return Err(AppError::invalid_path("The root is not a valid destination."));
        }
        paths::sanitize_leaf(leaf_of(&key))?;
        let response = self
            .s3_request(Method::PUT, &key, &[], Some(bytes.to_vec()), &[])
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            _ => Err(upstream_from_response(response).await),
        }
    }

    async fn delete(&self, path: &str) -> AppResult<()> {
        let key = self.key_for(path)?;
        if key == self.key_for("/")? {
            return Err(AppError::invalid_path("The root cannot be deleted."));
        }
        // Recursive: everything under the simulated directory first,
        // including its placeholder, then the named object itself. Objects
        // that are already gone are no-ops, so the whole operation is
        // idempotent.
        let children = self.list_keys_with_prefix(&format!("{key}/")).await?;
        for child in &children {
            let response = self.s3_request(Method::DELETE, child, &[], None, &[]).await?;
            if !matches!(
                response.status(),
                StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::ACCEPTED | StatusCode::NOT_FOUND
            ) {
                return Err(upstream_from_response(response).await);
            }
        }
        let response = self.s3_request(Method::DELETE, &key, &[], None, &[]).await?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::ACCEPTED | StatusCode::NOT_FOUND => {
                Ok(())
            }
            _ => Err(upstream_from_response(response).await),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> AppResult<()> {
        self.copy(from, to).await?;
        self.delete(from).await
    }

    async fn copy(&self, from: &str, to: &str) -> AppResult<()> {
        let src_key = self.key_for(from)?;
        let dest_key = self.key_for(to)?;
        self.guard_copy_keys(&src_key, &dest_key)?;
        if self.stat(to).await?.is_some() {
            return Err(AppError::conflict("Destination already exists."));
        }

        // A simulated directory copies key-by-key; its placeholder travels
        // with the rest of the prefix listing.
        let src_prefix = format!("{src_key}/");
        let children = self.list_keys_with_prefix(&src_prefix).await?;
        let object_exists = self.head_exists(&src_key).await?.is_some();
        if children.is_empty() && !object_exists {
            return Err(AppError::not_found("Path not found."));
        }
        if object_exists {
            self.copy_object(&src_key, &dest_key).await?;
        }
        for child in &children {
            let target = child.replacen(&src_prefix, &format!("{dest_key}/"), 1);
            self.copy_object(child, &target).await?;
        }
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> AppResult<()> {
        let key = self.key_for(path)?;
        if key == self.key_for("/")? {
            return Err(AppError::invalid_path("The root already exists."));
        }
        paths::sanitize_leaf(leaf_of(&key))?;
        // A zero-byte object whose key ends in `/` makes the prefix
        // discoverable.
        let placeholder = format!("{key}/");
        let response = self
            .s3_request(Method::PUT, &placeholder, &[], Some(Vec::new()), &[])
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => Ok(()),
            _ => Err(upstream_from_response(response).await),
        }
    }

    async fn exists(&self, path: &str) -> AppResult<bool> {
        Ok(self.stat(path).await?.is_some())
    }
}
