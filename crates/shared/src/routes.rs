use serde::{Deserialize, Serialize};

use crate::protocol::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppRoute {
    Home,
    Host,
    Vote,
    Screen,
    Results,
    SignIn,
    Register,
}

impl AppRoute {
    pub const ALL: [AppRoute; 7] = [
        AppRoute::Home,
        AppRoute::Host,
        AppRoute::Vote,
        AppRoute::Screen,
        AppRoute::Results,
        AppRoute::SignIn,
        AppRoute::Register,
    ];

    pub fn path(self) -> &'static str {
        match self {
            AppRoute::Home => "/",
            AppRoute::Host => "/host",
            AppRoute::Vote => "/vote",
            AppRoute::Screen => "/screen",
            AppRoute::Results => "/results",
            AppRoute::SignIn => "/signin",
            AppRoute::Register => "/register",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        let trimmed = path.trim();
        let normalized = if trimmed.len() > 1 {
            trimmed.trim_end_matches('/')
        } else {
            trimmed
        };
        Self::ALL.into_iter().find(|route| route.path() == normalized)
    }

    /// Landing page for a signed-in identity.
    pub fn home_for(identity: &Identity) -> Self {
        if identity.is_admin() {
            AppRoute::Host
        } else {
            AppRoute::Vote
        }
    }
}

/// Role-gated redirect: where a request for `requested` actually lands.
pub fn resolve_route(requested: AppRoute, identity: Option<&Identity>) -> AppRoute {
    match (requested, identity) {
        (AppRoute::Screen | AppRoute::Results, _) => requested,
        (AppRoute::Host | AppRoute::Vote, None) => AppRoute::SignIn,
        (AppRoute::Home | AppRoute::SignIn | AppRoute::Register, None) => requested,
        (AppRoute::Home | AppRoute::SignIn | AppRoute::Register, Some(identity)) => {
            AppRoute::home_for(identity)
        }
        (AppRoute::Host | AppRoute::Vote, Some(identity)) => AppRoute::home_for(identity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ParticipantId, Role, UserId};

    fn identity(role: Role) -> Identity {
        Identity {
            user_id: UserId(1),
            username: "ana".into(),
            participant_id: Some(ParticipantId(7)),
            role,
        }
    }

    #[test]
    fn unauthenticated_users_are_sent_to_signin() {
        assert_eq!(resolve_route(AppRoute::Host, None), AppRoute::SignIn);
        assert_eq!(resolve_route(AppRoute::Vote, None), AppRoute::SignIn);
        assert_eq!(resolve_route(AppRoute::Register, None), AppRoute::Register);
        assert_eq!(resolve_route(AppRoute::Screen, None), AppRoute::Screen);
    }

    #[test]
    fn roles_land_on_their_own_view() {
        let admin = identity(Role::Admin);
        let voter = identity(Role::Participant);
        assert_eq!(resolve_route(AppRoute::SignIn, Some(&admin)), AppRoute::Host);
        assert_eq!(resolve_route(AppRoute::Vote, Some(&admin)), AppRoute::Host);
        assert_eq!(resolve_route(AppRoute::Host, Some(&voter)), AppRoute::Vote);
        assert_eq!(resolve_route(AppRoute::Home, Some(&voter)), AppRoute::Vote);
        assert_eq!(resolve_route(AppRoute::Results, Some(&voter)), AppRoute::Results);
    }

    #[test]
    fn parses_paths_with_trailing_slash() {
        assert_eq!(AppRoute::from_path("/host/"), Some(AppRoute::Host));
        assert_eq!(AppRoute::from_path("/"), Some(AppRoute::Home));
        assert_eq!(AppRoute::from_path("/admin"), None);
    }
}
