//! HTTP client for the indexing service.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};

use crate::{
   collab::{Entitlements, FileUploader, ManifestFetcher, UploadRequest},
   config::Config,
   error::{HttpError, Result},
   types::{Manifest, Organization},
};

/// Talks to `{api_url}/v1`. Every request carries the caller's bearer token.
#[derive(Clone)]
pub struct HttpClient {
   client:   Client,
   base_url: String,
}

impl HttpClient {
   pub fn new(settings: &Config) -> Result<Self> {
      let client = Client::builder()
         .timeout(settings.http_timeout())
         .user_agent(concat!("indexsync/", env!("CARGO_PKG_VERSION")))
         .build()
         .map_err(HttpError::Request)?;
      Ok(Self { client, base_url: settings.api_url.trim_end_matches('/').to_string() })
   }

   pub fn shared(settings: &Config) -> Result<Arc<Self>> {
      Self::new(settings).map(Arc::new)
   }

   fn url(&self, path: &str) -> String {
      format!("{}/v1/{path}", self.base_url)
   }

   fn project_url(&self, organization_id: &str, project_id: &str, tail: &str) -> String {
      self.url(&format!("organizations/{organization_id}/projects/{project_id}/{tail}"))
   }

   async fn send(request: RequestBuilder, token: &str) -> Result<Response> {
      let response = request
         .bearer_auth(token)
         .send()
         .await
         .map_err(HttpError::Request)?;
      Ok(response)
   }
}

fn check_status(response: Response) -> Result<Response> {
   let status = response.status();
   if !status.is_success() {
      return Err(HttpError::StatusCode(status.as_u16()).into());
   }
   Ok(response)
}

#[async_trait]
impl ManifestFetcher for HttpClient {
   async fn fetch(
      &self,
      organization_id: &str,
      project_id: &str,
      branch: &str,
      token: &str,
   ) -> Result<Manifest> {
      let request = self
         .client
         .get(self.project_url(organization_id, project_id, "manifest"))
         .query(&[("branch", branch)]);
      let response = check_status(Self::send(request, token).await?)?;
      let manifest: Manifest = response.json().await.map_err(HttpError::Request)?;
      tracing::debug!(
         "manifest for {project_id}:{branch} lists {} files",
         manifest.files.len()
      );
      Ok(manifest)
   }
}

#[async_trait]
impl FileUploader for HttpClient {
   async fn upload(&self, request: UploadRequest) -> Result<()> {
      let is_base_branch = if request.is_base_branch { "true" } else { "false" };
      let http = self
         .client
         .put(self.project_url(&request.organization_id, &request.project_id, "files"))
         .query(&[
            ("path", request.file_path.as_str()),
            ("hash", request.file_hash.as_str()),
            ("branch", request.git_branch.as_str()),
            ("isBaseBranch", is_base_branch),
         ])
         .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
         .body(request.file_bytes);
      check_status(Self::send(http, &request.token).await?)?;
      Ok(())
   }
}

#[async_trait]
impl Entitlements for HttpClient {
   async fn fetch_organization(
      &self,
      token: &str,
      organization_id: &str,
      tester_warnings_disabled_until: Option<i64>,
   ) -> Result<Option<Organization>> {
      let mut request = self.client.get(self.url(&format!("organizations/{organization_id}")));
      if let Some(until) = tester_warnings_disabled_until {
         request = request.query(&[("testerWarningsDisabledUntil", until)]);
      }
      let response = Self::send(request, token).await?;
      if response.status() == StatusCode::NOT_FOUND {
         return Ok(None);
      }
      let organization = check_status(response)?
         .json()
         .await
         .map_err(HttpError::Request)?;
      Ok(Some(organization))
   }
}
