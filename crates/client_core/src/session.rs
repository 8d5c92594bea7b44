use std::sync::Arc;

use shared::{
    protocol::{Identity, RegisterRequest, SignInRequest},
    routes::{resolve_route, AppRoute},
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{ClientError, VotingApi};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthStatus {
    pub identity: Option<Identity>,
    pub loading: bool,
    pub message: Option<String>,
    pub error: Option<String>,
}

/// Owns the signed-in identity and publishes [`AuthStatus`] changes.
pub struct SessionProvider<A: VotingApi + ?Sized> {
    api: Arc<A>,
    status: watch::Sender<AuthStatus>,
}

impl<A: VotingApi + ?Sized> SessionProvider<A> {
    pub fn new(api: Arc<A>) -> Self {
        let (status, _) = watch::channel(AuthStatus::default());
        Self { api, status }
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> AuthStatus {
        self.status.borrow().clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.status.borrow().identity.clone()
    }

    pub fn route(&self, requested: AppRoute) -> AppRoute {
        resolve_route(requested, self.status.borrow().identity.as_ref())
    }

    /// On success the caller is sent to the sign-in page.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        username: &str,
    ) -> Result<AppRoute, ClientError> {
        self.start();
        let result = self
            .api
            .register(&RegisterRequest {
                email: email.to_string(),
                password: password.to_string(),
                username: username.to_string(),
            })
            .await;
        match result {
            Ok(response) => {
                self.finish(|s| s.message = Some(response.message));
                Ok(AppRoute::SignIn)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AppRoute, ClientError> {
        self.start();
        let result = self
            .api
            .sign_in(&SignInRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .await;
        match result {
            Ok(response) => {
                info!(role = response.identity.role.as_str(), "session started");
                let route = response.route;
                self.finish(|s| {
                    s.identity = Some(response.identity);
                    s.message = Some(response.message);
                });
                Ok(route)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Re-reads the identity behind the current token, picking up role changes.
    pub async fn refresh(&self) -> Result<Identity, ClientError> {
        self.start();
        match self.api.me().await {
            Ok(identity) => {
                self.finish(|s| s.identity = Some(identity.clone()));
                Ok(identity)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    pub async fn sign_out(&self) -> AppRoute {
        self.api.sign_out().await;
        self.status.send_replace(AuthStatus {
            message: Some("signed out".into()),
            ..AuthStatus::default()
        });
        AppRoute::Home
    }

    fn start(&self) {
        self.status.send_modify(|s| {
            s.loading = true;
            s.message = None;
            s.error = None;
        });
    }

    fn finish(&self, update: impl FnOnce(&mut AuthStatus)) {
        self.status.send_modify(|s| {
            s.loading = false;
            update(s);
        });
    }

    fn fail(&self, err: ClientError) -> ClientError {
        warn!(%err, "auth request failed");
        let message = err.to_string();
        self.status.send_modify(|s| {
            s.loading = false;
            s.error = Some(message);
        });
        err
    }
}
