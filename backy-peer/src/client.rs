//! The peer-facing half of the admin HTTP API: a plain request/response
//! trait rather than a commitment to a server framework, plus a blocking
//! `reqwest` implementation for talking to a real peer's admin API.

use std::collections::BTreeSet;
use std::time::Duration;

use backy_api_types::{BackyError, StatusDict, TagUpdateRequest};
use backy_revision::RevisionInfo;

/// Everything a job's scheduler needs from a neighbour: status for leader
/// election, touch/list for the pull phase, tag pushes for the push phase.
/// A failing call always returns `BackyError::PeerUnavailable` so callers
/// can treat any peer failure the same way (log and move on).
pub trait PeerClient: Send + Sync {
    /// `GET /v1/status?filter=<regex>`, used with `^{job}$` to ask one
    /// peer about one job.
    fn fetch_status(&self, job_filter: &str) -> Result<Vec<StatusDict>, BackyError>;

    /// `POST /v1/backups/{job}/touch`.
    fn touch_backup(&self, job: &str) -> Result<(), BackyError>;

    /// `GET /v1/backups/{job}/revs?only_clean=1|0`.
    fn get_revs(&self, job: &str, only_clean: bool) -> Result<Vec<RevisionInfo>, BackyError>;

    /// `PUT /v1/backups/{job}/revs/{spec}/tags?autoremove=0|1`.
    fn put_tags(
        &self,
        job: &str,
        spec: &str,
        old_tags: &BTreeSet<String>,
        new_tags: &BTreeSet<String>,
        autoremove: bool,
    ) -> Result<(), BackyError>;

    /// `POST /v1/backups/{job}/purge`.
    fn run_purge(&self, job: &str) -> Result<(), BackyError>;
}

/// A named neighbour: the peer's identity (matches a revision's `server`
/// field) plus the client used to reach it.
pub struct Peer {
    pub name: String,
    pub client: Box<dyn PeerClient>,
}

/// `PeerClient` over a real admin API, authenticated with a bearer token.
pub struct ReqwestPeerClient {
    base_url: String,
    token: String,
    http: reqwest::blocking::Client,
}

impl ReqwestPeerClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        ReqwestPeerClient {
            base_url: base_url.into(),
            token: token.into(),
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("building reqwest client"),
        }
    }

    fn unavailable(&self, reason: impl std::fmt::Display) -> BackyError {
        BackyError::PeerUnavailable {
            peer: self.base_url.clone(),
            reason: reason.to_string(),
        }
    }
}

impl PeerClient for ReqwestPeerClient {
    fn fetch_status(&self, job_filter: &str) -> Result<Vec<StatusDict>, BackyError> {
        let resp = self
            .http
            .get(format!("{}/v1/status", self.base_url))
            .bearer_auth(&self.token)
            .query(&[("filter", job_filter)])
            .send()
            .map_err(|err| self.unavailable(err))?;
        if !resp.status().is_success() {
            return Err(self.unavailable(resp.status()));
        }
        resp.json().map_err(|err| self.unavailable(err))
    }

    fn touch_backup(&self, job: &str) -> Result<(), BackyError> {
        let resp = self
            .http
            .post(format!("{}/v1/backups/{job}/touch", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .map_err(|err| self.unavailable(err))?;
        if !resp.status().is_success() {
            return Err(self.unavailable(resp.status()));
        }
        Ok(())
    }

    fn get_revs(&self, job: &str, only_clean: bool) -> Result<Vec<RevisionInfo>, BackyError> {
        let resp = self
            .http
            .get(format!("{}/v1/backups/{job}/revs", self.base_url))
            .bearer_auth(&self.token)
            .query(&[("only_clean", if only_clean { "1" } else { "0" })])
            .send()
            .map_err(|err| self.unavailable(err))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND
            || resp.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(self.unavailable(resp.status()));
        }
        resp.json().map_err(|err| self.unavailable(err))
    }

    fn put_tags(
        &self,
        job: &str,
        spec: &str,
        old_tags: &BTreeSet<String>,
        new_tags: &BTreeSet<String>,
        autoremove: bool,
    ) -> Result<(), BackyError> {
        let body = TagUpdateRequest {
            old_tags: old_tags.iter().cloned().collect(),
            new_tags: new_tags.iter().cloned().collect(),
        };
        let resp = self
            .http
            .put(format!(
                "{}/v1/backups/{job}/revs/{spec}/tags",
                self.base_url
            ))
            .bearer_auth(&self.token)
            .query(&[("autoremove", if autoremove { "1" } else { "0" })])
            .json(&body)
            .send()
            .map_err(|err| self.unavailable(err))?;
        match resp.status().as_u16() {
            204 => Ok(()),
            404 => Err(BackyError::RevisionNotFound(spec.to_string())),
            412 => Err(BackyError::TagExpectationFailed(spec.to_string())),
            _ => Err(self.unavailable(resp.status())),
        }
    }

    fn run_purge(&self, job: &str) -> Result<(), BackyError> {
        let resp = self
            .http
            .post(format!("{}/v1/backups/{job}/purge", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .map_err(|err| self.unavailable(err))?;
        if !resp.status().is_success() {
            return Err(self.unavailable(resp.status()));
        }
        Ok(())
    }
}
