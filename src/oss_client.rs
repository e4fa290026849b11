use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as base64_engine;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use sha1::Sha1;
use std::time::Duration;

type HmacSha1 = Hmac<Sha1>;

/// 对象键编码：保留路径分隔符和 RFC 3986 非保留字符
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// 查询参数编码
const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// 对象存储能力：写入后返回可访问的 URL，按键删除
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<String>;

    async fn delete_object(&self, key: &str) -> Result<()>;
}

/// OSS 连接配置
#[derive(Debug, Clone)]
pub struct OssConfig {
    pub bucket: String,
    /// 例如 `oss-cn-hangzhou.aliyuncs.com`；带协议前缀时使用 path-style 访问
    pub endpoint: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    /// STS 临时凭证
    pub security_token: Option<String>,
    /// 对外访问地址（CDN 等），设置后公开 URL 为 `{public_base_url}/{key}`
    pub public_base_url: Option<String>,
    /// 设置后返回带签名的临时 GET URL
    pub url_expiry: Option<Duration>,
    pub timeout: Duration,
}

/// OSS 客户端
///
/// 手动实现 OSS V1 签名（HMAC-SHA1），只使用 PUT / DELETE 和 URL 签名。
pub struct OssClient {
    client: Client,
    config: OssConfig,
}

impl OssClient {
    pub fn new(config: OssConfig) -> Result<Self> {
        if config.bucket.is_empty() {
            anyhow::bail!("OSS bucket 不能为空");
        }
        if config.endpoint.is_empty() {
            anyhow::bail!("OSS endpoint 不能为空");
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("创建 HTTP 客户端失败")?;

        Ok(Self { client, config })
    }

    /// 请求地址
    fn request_url(&self, object_key: &str) -> String {
        let encoded_key = utf8_percent_encode(object_key, KEY_ENCODE_SET).to_string();
        let endpoint = self.config.endpoint.trim_end_matches('/');

        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            format!("{}/{}/{}", endpoint, self.config.bucket, encoded_key)
        } else {
            format!("https://{}.{}/{}", self.config.bucket, endpoint, encoded_key)
        }
    }

    /// 供分析服务拉取的地址
    pub fn object_url(&self, object_key: &str) -> Result<String> {
        match self.config.url_expiry {
            Some(expiry) => self.presigned_get_url(object_key, expiry),
            None => Ok(match &self.config.public_base_url {
                Some(base) => format!(
                    "{}/{}",
                    base.trim_end_matches('/'),
                    utf8_percent_encode(object_key, KEY_ENCODE_SET)
                ),
                None => self.request_url(object_key),
            }),
        }
    }

    /// URL 签名：参考 https://help.aliyun.com/document_detail/31952.html
    fn presigned_get_url(&self, object_key: &str, expiry: Duration) -> Result<String> {
        let expires = Utc::now().timestamp() + expiry.as_secs() as i64;

        let mut resource = self.canonicalized_resource(object_key);
        if let Some(token) = &self.config.security_token {
            resource.push_str(&format!("?security-token={}", token));
        }

        let string_to_sign = format!("GET\n\n\n{}\n{}", expires, resource);
        let signature = self.sign(&string_to_sign)?;

        let mut url = format!(
            "{}?OSSAccessKeyId={}&Expires={}&Signature={}",
            self.request_url(object_key),
            utf8_percent_encode(&self.config.access_key_id, QUERY_ENCODE_SET),
            expires,
            utf8_percent_encode(&signature, QUERY_ENCODE_SET),
        );
        if let Some(token) = &self.config.security_token {
            url.push_str("&security-token=");
            url.push_str(&utf8_percent_encode(token, QUERY_ENCODE_SET).to_string());
        }
        Ok(url)
    }

    fn canonicalized_resource(&self, object_key: &str) -> String {
        format!("/{}/{}", self.config.bucket, object_key)
    }

    fn sign(&self, string_to_sign: &str) -> Result<String> {
        let mut mac = HmacSha1::new_from_slice(self.config.access_key_secret.as_bytes())
            .context("创建 HMAC 失败")?;
        mac.update(string_to_sign.as_bytes());
        Ok(base64_engine.encode(mac.finalize().into_bytes()))
    }

    /// 请求签名：参考 https://help.aliyun.com/document_detail/31951.html
    fn string_to_sign(method: &str, headers: &HeaderMap, resource: &str) -> String {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };

        let mut oss_headers: Vec<(String, String)> = headers
            .iter()
            .filter(|(name, _)| name.as_str().starts_with("x-oss-"))
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or("").trim().to_string(),
                )
            })
            .collect();
        oss_headers.sort();

        let canonicalized_oss_headers: String = oss_headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        format!(
            "{}\n{}\n{}\n{}\n{}{}",
            method,
            header("content-md5"),
            header("content-type"),
            header("date"),
            canonicalized_oss_headers,
            resource
        )
    }

    fn signed_headers(
        &self,
        method: &str,
        object_key: &str,
        content_type: Option<&str>,
    ) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        headers.insert(
            "date",
            HeaderValue::from_str(&date).context("创建 Date header 失败")?,
        );

        if let Some(ct) = content_type {
            headers.insert(
                "content-type",
                HeaderValue::from_str(ct).context("创建 Content-Type header 失败")?,
            );
        }

        if let Some(token) = &self.config.security_token {
            headers.insert(
                "x-oss-security-token",
                HeaderValue::from_str(token).context("创建 Security-Token header 失败")?,
            );
        }

        let string_to_sign =
            Self::string_to_sign(method, &headers, &self.canonicalized_resource(object_key));
        let authorization = format!(
            "OSS {}:{}",
            self.config.access_key_id,
            self.sign(&string_to_sign)?
        );
        headers.insert(
            "authorization",
            HeaderValue::from_str(&authorization).context("创建 Authorization header 失败")?,
        );

        Ok(headers)
    }
}

#[async_trait]
impl ObjectStore for OssClient {
    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<String> {
        tracing::debug!(
            "⬆️  [OSS] 上传对象: bucket={}, key={}, size={}",
            self.config.bucket,
            key,
            body.len()
        );

        let headers = self.signed_headers("PUT", key, Some(content_type))?;
        let response = self
            .client
            .put(self.request_url(key))
            .headers(headers)
            .body(body)
            .send()
            .await
            .context("上传文件失败")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("上传文件失败: HTTP {} - {}", status, error_text);
        }

        self.object_url(key)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let headers = self.signed_headers("DELETE", key, None)?;
        let response = self
            .client
            .delete(self.request_url(key))
            .headers(headers)
            .send()
            .await
            .context("删除对象失败")?;

        match response.status() {
            status if status.is_success() => Ok(()),
            // 对象已不存在，删除视为成功
            StatusCode::NOT_FOUND => {
                tracing::debug!("[OSS] 对象不存在，跳过删除: {}", key);
                Ok(())
            }
            status => {
                let error_text = response.text().await.unwrap_or_default();
                anyhow::bail!("删除对象失败: HTTP {} - {}", status, error_text);
            }
        }
    }
}
