//! Authentication/authorization for a path action: external HTTP auth,
//! IP allow-lists, and query-string credentials, evaluated in a fixed
//! order where the first configured check that fails wins.

use crate::error::ConnError;
use ipnet::IpNet;
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Publish,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Publish => "publish",
        }
    }
}

/// Request passed to the authenticator; mirrors the fields a path's
/// `authenticate` callback is invoked with.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub path_name: String,
    pub action: Action,
    pub remote_ip: IpAddr,
    pub query_user: String,
    pub query_pass: String,
    pub raw_query: String,
}

#[derive(Serialize)]
struct ExternalAuthBody<'a> {
    ip: String,
    user: &'a str,
    pass: &'a str,
    path: &'a str,
    action: &'a str,
    query: &'a str,
}

/// Per-path authentication configuration, set at path-creation time.
#[derive(Debug, Clone, Default)]
pub struct PathAuthConfig {
    pub external_auth_url: Option<String>,
    pub allowed_ips: Vec<IpNet>,
    pub user: Option<String>,
    pub pass: Option<String>,
}

pub struct Authenticator {
    http: reqwest::Client,
}

impl Authenticator {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client build with static config cannot fail"),
        }
    }

    /// Runs the three checks in order. Returns `Ok(())` on success or the
    /// single `ConnError::AuthCritical` describing the first failure.
    pub async fn authenticate(
        &self,
        cfg: &PathAuthConfig,
        req: &AuthRequest,
    ) -> Result<(), ConnError> {
        if let Some(url) = &cfg.external_auth_url {
            self.check_external(url, req).await?;
        }

        if !cfg.allowed_ips.is_empty() {
            let allowed = cfg
                .allowed_ips
                .iter()
                .any(|net| net.contains(&req.remote_ip) || net.addr() == req.remote_ip);
            if !allowed {
                return Err(ConnError::AuthCritical(format!(
                    "IP {} is not allowed to {} path {}",
                    req.remote_ip,
                    req.action.as_str(),
                    req.path_name
                )));
            }
        }

        if let Some(user) = &cfg.user {
            let pass = cfg.pass.as_deref().unwrap_or("");
            if req.query_user != *user || req.query_pass != pass {
                return Err(ConnError::AuthCritical(format!(
                    "invalid credentials for path {}",
                    req.path_name
                )));
            }
        }

        Ok(())
    }

    async fn check_external(&self, url: &str, req: &AuthRequest) -> Result<(), ConnError> {
        let body = ExternalAuthBody {
            ip: req.remote_ip.to_string(),
            user: &req.query_user,
            pass: &req.query_pass,
            path: &req.path_name,
            action: req.action.as_str(),
            query: &req.raw_query,
        };

        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ConnError::AuthCritical(format!("external authentication failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ConnError::AuthCritical(format!(
                "external authentication failed: status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

/// Mandatory anti-brute-force delay applied before closing a connection
/// that failed a critical auth check.
pub const CRITICAL_AUTH_DELAY: Duration = Duration::from_secs(2);

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn req(user: &str, pass: &str) -> AuthRequest {
        AuthRequest {
            path_name: "live".into(),
            action: Action::Publish,
            remote_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            query_user: user.into(),
            query_pass: pass.into(),
            raw_query: format!("user={user}&pass={pass}"),
        }
    }

    #[tokio::test]
    async fn empty_config_always_passes() {
        let auth = Authenticator::new();
        let cfg = PathAuthConfig::default();
        assert!(auth.authenticate(&cfg, &req("anyone", "anything")).await.is_ok());
    }

    #[tokio::test]
    async fn ip_allow_list_rejects_outside_cidr() {
        let auth = Authenticator::new();
        let cfg = PathAuthConfig {
            allowed_ips: vec!["192.168.0.0/24".parse().unwrap()],
            ..Default::default()
        };
        let err = auth.authenticate(&cfg, &req("u", "p")).await.unwrap_err();
        assert!(matches!(err, ConnError::AuthCritical(_)));
    }

    #[tokio::test]
    async fn ip_allow_list_accepts_inside_cidr() {
        let auth = Authenticator::new();
        let cfg = PathAuthConfig {
            allowed_ips: vec!["10.0.0.0/8".parse().unwrap()],
            ..Default::default()
        };
        assert!(auth.authenticate(&cfg, &req("u", "p")).await.is_ok());
    }

    #[tokio::test]
    async fn query_credentials_must_match_exactly() {
        let auth = Authenticator::new();
        let cfg = PathAuthConfig {
            user: Some("alice".into()),
            pass: Some("secret".into()),
            ..Default::default()
        };
        assert!(auth.authenticate(&cfg, &req("alice", "secret")).await.is_ok());
        let err = auth.authenticate(&cfg, &req("alice", "wrong")).await.unwrap_err();
        assert!(matches!(err, ConnError::AuthCritical(_)));
    }
}
