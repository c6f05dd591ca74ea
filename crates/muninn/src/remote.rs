//! Built-in HTTP(S) remote transport.
//!
//! Other transports (FTP, SFTP, S3 pull) plug in through the
//! [`RemoteBackend`](crate::plugin::RemoteBackend) trait; only HTTP ships
//! with the core. Timeouts retry once before surfacing as storage errors.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::config::Credential;
use crate::error::{Error, Result};
use crate::plugin::RemoteBackend;
use crate::properties::Properties;

pub struct HttpRemoteBackend {
    client: reqwest::Client,
}

impl HttpRemoteBackend {
    pub fn new(timeout: Duration) -> Result<HttpRemoteBackend> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::storage_with("cannot build the HTTP client", e))?;
        Ok(HttpRemoteBackend { client })
    }

    async fn bearer_token(&self, credential: &Credential) -> Result<Option<String>> {
        let Credential::OAuth2 {
            grant_type,
            username,
            password,
            client_id,
            client_secret,
            token_url,
            auth_args,
        } = credential
        else {
            return Ok(None);
        };
        let mut form = vec![
            ("grant_type".to_string(), grant_type.clone()),
            ("username".to_string(), username.clone()),
            ("password".to_string(), password.clone()),
            ("client_id".to_string(), client_id.clone()),
            ("client_secret".to_string(), client_secret.clone()),
        ];
        if let Some(serde_json::Value::Object(args)) = auth_args {
            for (key, value) in args {
                if let Some(value) = value.as_str() {
                    form.push((key.clone(), value.to_string()));
                }
            }
        }
        let response = self
            .client
            .post(token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::storage_with("token request failed", e))?;
        if !response.status().is_success() {
            return Err(Error::storage(format!(
                "token request failed with status {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::storage_with("token response is not valid JSON", e))?;
        body.get("access_token")
            .and_then(|v| v.as_str())
            .map(|t| Some(t.to_string()))
            .ok_or_else(|| Error::storage("token response carries no access_token"))
    }

    async fn download(
        &self,
        url: &Url,
        target: &Path,
        credential: Option<&Credential>,
    ) -> std::result::Result<(), DownloadError> {
        let mut request = self.client.get(url.clone());
        match credential {
            Some(Credential::Basic { username, password }) => {
                request = request.basic_auth(username, Some(password));
            }
            Some(oauth @ Credential::OAuth2 { .. }) => {
                if let Some(token) = self
                    .bearer_token(oauth)
                    .await
                    .map_err(DownloadError::Fatal)?
                {
                    request = request.bearer_auth(token);
                }
            }
            _ => {}
        }
        let response = request.send().await.map_err(classify)?;
        if !response.status().is_success() {
            return Err(DownloadError::Fatal(Error::storage(format!(
                "remote fetch of {} failed with status {}",
                url,
                response.status()
            ))));
        }
        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|e| DownloadError::Fatal(e.into()))?;
        let mut stream = response.bytes_stream();
        loop {
            match stream.try_next().await {
                Ok(Some(chunk)) => file
                    .write_all(&chunk)
                    .await
                    .map_err(|e| DownloadError::Fatal(e.into()))?,
                Ok(None) => break,
                Err(err) => return Err(classify(err)),
            }
        }
        file.flush()
            .await
            .map_err(|e| DownloadError::Fatal(e.into()))?;
        Ok(())
    }
}

enum DownloadError {
    Timeout(Error),
    Fatal(Error),
}

fn classify(err: reqwest::Error) -> DownloadError {
    let timeout = err.is_timeout();
    let wrapped = Error::storage_with("remote fetch failed", err);
    if timeout {
        DownloadError::Timeout(wrapped)
    } else {
        DownloadError::Fatal(wrapped)
    }
}

#[async_trait]
impl RemoteBackend for HttpRemoteBackend {
    fn identify(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    async fn pull(
        &self,
        product: &Properties,
        target_dir: &Path,
        credentials: Option<&Credential>,
    ) -> Result<Vec<PathBuf>> {
        let url_text = product
            .remote_url()
            .ok_or_else(|| Error::State("product has no remote_url".to_string()))?;
        let url: Url = url_text
            .parse()
            .map_err(|_| Error::storage(format!("malformed remote URL {:?}", url_text)))?;
        let name = url
            .path_segments()
            .and_then(|segments| segments.last())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| product.physical_name().map(str::to_string))
            .ok_or_else(|| {
                Error::storage(format!("cannot derive a file name from {}", url))
            })?;
        let target = target_dir.join(name);

        match self.download(&url, &target, credentials).await {
            Ok(()) => Ok(vec![target]),
            Err(DownloadError::Fatal(err)) => Err(err),
            Err(DownloadError::Timeout(first)) => {
                tracing::warn!(url = %url, error = %first, "remote fetch timed out; retrying once");
                match self.download(&url, &target, credentials).await {
                    Ok(()) => Ok(vec![target]),
                    Err(DownloadError::Fatal(err)) | Err(DownloadError::Timeout(err)) => Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identifies_http_and_https_only() {
        let backend = HttpRemoteBackend::new(Duration::from_secs(60)).unwrap();
        assert!(backend.identify(&"http://example.com/a.dat".parse().unwrap()));
        assert!(backend.identify(&"https://example.com/a.dat".parse().unwrap()));
        assert!(!backend.identify(&"ftp://example.com/a.dat".parse().unwrap()));
        assert!(!backend.identify(&"s3://bucket/a.dat".parse().unwrap()));
    }
}
