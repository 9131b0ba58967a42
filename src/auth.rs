//! Discord login and the extractors guarding authenticated routes.
//!
//! The authenticated identity lives in the `tower-sessions` login session,
//! which is separate from the anonymous tracking session.

use axum::{extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use tracing::debug;
use url::Url;

use crate::{
    app::AppState, config::DiscordConfig, entity::discord_user, error::AppError,
    poller::FetchError,
};

pub const AUTHORIZE_URL: &str = "https://discord.com/api/oauth2/authorize";
pub const TOKEN_URL: &str = "https://discord.com/api/oauth2/token";
pub const PROFILE_URL: &str = "https://discord.com/api/users/@me";
pub const OAUTH_SCOPE: &str = "identify email";

/// Login session key holding the [`CurrentUser`].
pub const USER_KEY: &str = "user";
/// Login session key holding the CSRF state of a pending authorization.
pub const STATE_KEY: &str = "oauth_state";

pub const SUPER_ADMIN_ROLE: &str = "super_admin";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    pub id: String,
    pub discord_id: String,
    pub username: String,
    pub avatar: Option<String>,
    pub is_admin: bool,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl CurrentUser {
    pub fn from_model(model: &discord_user::Model) -> Self {
        Self {
            id: model.id.clone(),
            discord_id: model.discord_id.clone(),
            username: model.username.clone(),
            avatar: model.avatar.clone(),
            is_admin: model.is_admin,
            roles: model.role_list(),
        }
    }

    /// Identity for deployments without a datastore. The Discord id doubles
    /// as the account id.
    pub fn from_profile(profile: &DiscordProfile, super_admin: Option<&str>) -> Self {
        let is_admin = super_admin == Some(profile.id.as_str());
        Self {
            id: profile.id.clone(),
            discord_id: profile.id.clone(),
            username: profile.username.clone(),
            avatar: profile.avatar_url(),
            is_admin,
            roles: if is_admin {
                vec![SUPER_ADMIN_ROLE.to_string()]
            } else {
                Vec::new()
            },
        }
    }

    pub async fn from_session(session: &Session) -> Result<Option<Self>, AppError> {
        Ok(session.get(USER_KEY).await?)
    }
}

async fn login_session<S>(parts: &mut Parts, state: &S) -> Result<Session, AppError>
where
    S: Send + Sync,
{
    Session::from_request_parts(parts, state)
        .await
        .map_err(|(_, message)| AppError::Internal(message.to_string()))
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = login_session(parts, state).await?;
        CurrentUser::from_session(&session)
            .await?
            .ok_or(AppError::Unauthenticated)
    }
}

/// A [`CurrentUser`] whose admin flag has been confirmed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminUser(pub CurrentUser);

impl AdminUser {
    pub fn from_user(user: CurrentUser) -> Result<Self, AppError> {
        if user.is_admin {
            Ok(Self(user))
        } else {
            Err(AppError::Forbidden)
        }
    }

    pub fn user(&self) -> &CurrentUser {
        &self.0
    }
}

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let mut user = CurrentUser::from_request_parts(parts, state).await?;

        // Admin grants and revocations take effect without a new login.
        if let Some(datastore) = &state.datastore {
            match datastore.find_user(&user.id).await? {
                Some(model) => {
                    user.is_admin = model.is_admin;
                    user.roles = model.role_list();
                }
                None => return Err(AppError::Unauthenticated),
            }
        }

        AdminUser::from_user(user)
    }
}

/// The subset of `/users/@me` the server uses.
#[derive(Clone, Debug, Deserialize)]
pub struct DiscordProfile {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub discriminator: Option<String>,
}

impl DiscordProfile {
    pub fn avatar_url(&self) -> Option<String> {
        self.avatar
            .as_ref()
            .map(|hash| format!("https://cdn.discordapp.com/avatars/{}/{hash}.png", self.id))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Clone, Debug)]
pub struct DiscordOAuth {
    client: reqwest::Client,
    config: DiscordConfig,
}

impl DiscordOAuth {
    pub fn new(config: DiscordConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn authorize_url(&self, state: &str) -> Result<Url, FetchError> {
        Url::parse_with_params(
            AUTHORIZE_URL,
            [
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", OAUTH_SCOPE),
                ("state", state),
            ],
        )
        .map_err(FetchError::from)
    }

    /// Trades an authorization code for an access token.
    pub async fn exchange_code(&self, code: &str) -> Result<String, FetchError> {
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ];

        let token: TokenResponse = self
            .client
            .post(TOKEN_URL)
            .form(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("Exchanged Discord authorization code");
        Ok(token.access_token)
    }

    pub async fn fetch_profile(&self, access_token: &str) -> Result<DiscordProfile, FetchError> {
        Ok(self
            .client
            .get(PROFILE_URL)
            .bearer_auth(access_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}
