/// Object storage publisher: signed S3 PUT against MinIO or any S3 endpoint

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::core::context::StorageDestination;
use crate::utils::ARCHIVE_CONTENT_TYPE;

const PATH_SEGMENT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const SERVICE: &str = "s3";
const HASH_CHUNK: usize = 64 * 1024;

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub bucket: String,
    pub key: String,
    pub bytes: u64,
    pub etag: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `file` under `dest.bucket`/`dest.key`; an existing object is overwritten
    async fn upload(&self, dest: &StorageDestination, file: &Path) -> Result<UploadReceipt>;
}

/// Path-style S3 publisher
pub struct S3Publisher {
    timeout: Duration,
}

impl S3Publisher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .context("Failed to build HTTP client")
    }
}

#[async_trait]
impl ObjectStore for S3Publisher {
    async fn upload(&self, dest: &StorageDestination, file: &Path) -> Result<UploadReceipt> {
        let metadata = tokio::fs::metadata(file)
            .await
            .with_context(|| format!("Archive {} not found", file.display()))?;
        if !metadata.is_file() {
            bail!("{} is not a file", file.display());
        }
        let bytes = metadata.len();

        let url = build_object_url(&dest.endpoint, &dest.bucket, &dest.key);
        let url = reqwest::Url::parse(&url).with_context(|| format!("Invalid object URL {}", url))?;
        let host = host_header(&url)?;
        let payload_hash = file_sha256(file).await?;

        let now = Utc::now();
        let authorization = build_sigv4_authorization(
            &SigningRequest {
                method: "PUT",
                uri_path: url.path(),
                host: &host,
                content_type: ARCHIVE_CONTENT_TYPE,
                payload_hash: &payload_hash,
            },
            dest.access_key.expose(),
            dest.secret_key.expose(),
            &dest.region,
            now,
        )?;

        debug!(url = %url, bytes, "uploading archive");
        let body = tokio::fs::File::open(file)
            .await
            .with_context(|| format!("Failed to open {}", file.display()))?;

        let response = self
            .client()?
            .put(url.clone())
            .header("Host", &host)
            .header("Content-Type", ARCHIVE_CONTENT_TYPE)
            .header("Content-Length", bytes)
            .header("x-amz-date", now.format("%Y%m%dT%H%M%SZ").to_string())
            .header("x-amz-content-sha256", &payload_hash)
            .header("Authorization", authorization)
            .body(reqwest::Body::from(body))
            .send()
            .await
            .with_context(|| format!("PUT {} failed", url))?;

        let status = response.status();
        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "storage returned status {}: {}",
                status,
                first_line(&text)
            ));
        }

        info!(bucket = %dest.bucket, key = %dest.key, bytes, "archive uploaded");
        Ok(UploadReceipt {
            bucket: dest.bucket.clone(),
            key: dest.key.clone(),
            bytes,
            etag,
        })
    }
}

/// `<endpoint>/<bucket>/<encoded key>`
pub fn build_object_url(endpoint: &str, bucket: &str, key: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    let encoded_key = utf8_percent_encode(key, PATH_SEGMENT_ENCODE_SET);
    format!("{}/{}/{}", base, bucket, encoded_key)
}

/// Host header value as the server sees it, port included when non-default
fn host_header(url: &reqwest::Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("Storage endpoint {} has no host", url))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

async fn file_sha256(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|e| anyhow!("HMAC key: {}", e))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

struct SigningRequest<'a> {
    method: &'a str,
    uri_path: &'a str,
    host: &'a str,
    content_type: &'a str,
    payload_hash: &'a str,
}

fn build_sigv4_authorization(
    req: &SigningRequest<'_>,
    access_key: &str,
    secret_key: &str,
    region: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let ds = now.format("%Y%m%d").to_string();
    let ad = now.format("%Y%m%dT%H%M%SZ").to_string();
    let scope = format!("{}/{}/{}/aws4_request", ds, region, SERVICE);
    let signed = "content-type;host;x-amz-content-sha256;x-amz-date";
    let headers = format!(
        "content-type:{}\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
        req.content_type, req.host, req.payload_hash, ad
    );
    let canonical = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        req.method, req.uri_path, headers, signed, req.payload_hash
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        ad,
        scope,
        hex_sha256(canonical.as_bytes())
    );
    let key = derive_signing_key(secret_key, &ds, region)?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);
    Ok(format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        access_key, scope, signed, signature
    ))
}

fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, SERVICE.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}
