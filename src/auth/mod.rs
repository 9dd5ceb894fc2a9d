//! Caller identity at the API boundary.
//!
//! Authentication happens upstream (the storefront gateway issues and checks
//! tokens); requests reach this service with the resolved principal in
//! headers. The extractor turns those into an [`Identity`] once, and services
//! receive it as a plain value.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::errors::ServiceError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const GUEST_ID_HEADER: &str = "x-guest-id";
pub const ROLES_HEADER: &str = "x-user-roles";

const MAX_GUEST_ID_LENGTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<Uuid>,
    pub guest_id: Option<String>,
    pub is_admin: bool,
}

impl Identity {
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            guest_id: None,
            is_admin: false,
        }
    }

    pub fn guest(guest_id: impl Into<String>) -> Self {
        Self {
            user_id: None,
            guest_id: Some(guest_id.into()),
            is_admin: false,
        }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self {
            is_admin: true,
            ..Self::user(user_id)
        }
    }

    /// Whether this caller owns a record stamped with the given owner.
    /// A signed-in user also owns what they created as a guest in the same
    /// browser session.
    pub fn owns(&self, user_id: Option<Uuid>, guest_id: Option<&str>) -> bool {
        match (user_id, guest_id) {
            (Some(owner), _) => self.user_id == Some(owner),
            (None, Some(owner)) => self.guest_id.as_deref() == Some(owner),
            (None, None) => false,
        }
    }

    pub fn can_access(&self, user_id: Option<Uuid>, guest_id: Option<&str>) -> bool {
        self.is_admin || self.owns(user_id, guest_id)
    }

    pub fn require_admin(&self) -> Result<(), ServiceError> {
        if self.is_admin {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(
                "This operation requires the admin role".to_string(),
            ))
        }
    }

    fn from_parts(parts: &Parts) -> Result<Self, ServiceError> {
        let user_id = header(parts, USER_ID_HEADER)
            .map(|raw| {
                Uuid::parse_str(raw).map_err(|_| {
                    ServiceError::Unauthorized("Malformed user identity".to_string())
                })
            })
            .transpose()?;

        let guest_id = match header(parts, GUEST_ID_HEADER) {
            Some(raw) if raw.len() > MAX_GUEST_ID_LENGTH => {
                return Err(ServiceError::Unauthorized(
                    "Malformed guest identity".to_string(),
                ))
            }
            Some(raw) => Some(raw.to_string()),
            None => None,
        };

        if user_id.is_none() && guest_id.is_none() {
            return Err(ServiceError::Unauthorized(
                "Request carries no user or guest identity".to_string(),
            ));
        }

        let is_admin = user_id.is_some()
            && header(parts, ROLES_HEADER)
                .map(|roles| {
                    roles
                        .split(',')
                        .any(|role| role.trim().eq_ignore_ascii_case("admin"))
                })
                .unwrap_or(false);

        Ok(Self {
            user_id,
            guest_id,
            is_admin,
        })
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_parts(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn resolves_users_guests_and_admins() {
        let user = Uuid::new_v4();
        let user_header = user.to_string();
        let identity = Identity::from_parts(&parts(&[
            (USER_ID_HEADER, user_header.as_str()),
            (ROLES_HEADER, "customer, admin"),
        ]))
        .unwrap();
        assert_eq!(identity.user_id, Some(user));
        assert!(identity.is_admin);

        let guest = Identity::from_parts(&parts(&[(GUEST_ID_HEADER, "g-123")])).unwrap();
        assert_eq!(guest.guest_id.as_deref(), Some("g-123"));
        assert!(!guest.is_admin);
    }

    #[test]
    fn guests_cannot_claim_admin() {
        let guest = Identity::from_parts(&parts(&[
            (GUEST_ID_HEADER, "g-123"),
            (ROLES_HEADER, "admin"),
        ]))
        .unwrap();
        assert!(!guest.is_admin);
    }

    #[test]
    fn anonymous_requests_are_rejected() {
        assert!(matches!(
            Identity::from_parts(&parts(&[])),
            Err(ServiceError::Unauthorized(_))
        ));
        assert!(Identity::from_parts(&parts(&[(USER_ID_HEADER, "not-a-uuid")])).is_err());
    }

    #[test]
    fn ownership_follows_the_stamped_owner() {
        let user = Uuid::new_v4();
        let identity = Identity::user(user);
        assert!(identity.owns(Some(user), None));
        assert!(!identity.owns(Some(Uuid::new_v4()), None));
        assert!(!identity.owns(None, Some("g-1")));
        assert!(Identity::guest("g-1").owns(None, Some("g-1")));
        assert!(Identity::admin(Uuid::new_v4()).can_access(Some(user), None));
    }
}
