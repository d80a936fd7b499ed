use crate::http::build_client;
use crate::models::Photo;
use crate::uploads::{LocalFile, MediaUploader, UploadError};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::Client;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct ImgbbConfig {
    pub upload_url: String,
    pub api_key: Option<String>,
}

impl ImgbbConfig {
    pub fn from_env() -> Self {
        Self {
            upload_url: std::env::var("IMGBB_UPLOAD_URL")
                .unwrap_or_else(|_| "https://api.imgbb.com/1/upload".into()),
            api_key: std::env::var("IMGBB_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
        }
    }
}

pub struct ImgbbUploader {
    http: Client,
    config: ImgbbConfig,
}

impl ImgbbUploader {
    pub fn new(config: ImgbbConfig) -> Self {
        Self {
            http: build_client(),
            config,
        }
    }
}

#[async_trait]
impl MediaUploader for ImgbbUploader {
    async fn upload(&self, file: &LocalFile) -> Result<Photo, UploadError> {
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or(UploadError::NotConfigured)?;
        if file.bytes.is_empty() {
            return Err(UploadError::EmptyFile);
        }

        let form = [
            ("image", STANDARD.encode(&file.bytes)),
            ("name", file.name.clone()),
        ];
        let response = self
            .http
            .post(&self.config.upload_url)
            .query(&[("key", key)])
            .form(&form)
            .send()
            .await
            .map_err(|err| UploadError::Http(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Rejected(rejection_message(status.as_u16(), &body)));
        }

        let payload: ImgbbResponse = response
            .json()
            .await
            .map_err(|err| UploadError::InvalidResponse(err.to_string()))?;
        payload.into_photo()
    }
}

fn rejection_message(status: u16, body: &str) -> String {
    serde_json::from_str::<ImgbbFailure>(body)
        .ok()
        .map(|failure| failure.error.message)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| format!("HTTP {status}"))
}

#[derive(Debug, Deserialize)]
struct ImgbbResponse {
    #[serde(default)]
    success: Option<bool>,
    data: Option<ImgbbImage>,
}

#[derive(Debug, Deserialize)]
struct ImgbbImage {
    url: String,
    #[serde(default)]
    delete_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImgbbFailure {
    error: ImgbbFailureDetail,
}

#[derive(Debug, Deserialize)]
struct ImgbbFailureDetail {
    #[serde(default)]
    message: String,
}

impl ImgbbResponse {
    fn into_photo(self) -> Result<Photo, UploadError> {
        if self.success == Some(false) {
            return Err(UploadError::Rejected("upload was not successful".into()));
        }
        let data = self
            .data
            .ok_or_else(|| UploadError::InvalidResponse("missing data".into()))?;
        if data.url.trim().is_empty() {
            return Err(UploadError::InvalidResponse("missing url".into()));
        }
        Ok(Photo {
            url: data.url,
            delete_url: data.delete_url,
        })
    }
}
