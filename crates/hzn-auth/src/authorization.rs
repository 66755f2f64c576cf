//! Bearer tokens carried in RPC call metadata

use crate::token::{Role, TokenError, TokenValidator, ValidToken};
use hzn_proto::Metadata;
use thiserror::Error;

/// Metadata key holding the bearer token
pub const AUTHORIZATION: &str = "authorization";

#[derive(Debug, Error)]
pub enum AuthError {
    /// No `authorization` value was sent with the call
    #[error("bad control token")]
    BadToken,

    #[error("bad control token: role was {0}")]
    WrongRole(Role),

    #[error("invalid token: {0}")]
    Invalid(#[from] TokenError),
}

/// First `authorization` value of a call, if any
pub fn bearer_token(metadata: &Metadata) -> Option<&str> {
    metadata.get(AUTHORIZATION)
}

/// Validate the call's bearer token and require it to carry `role`
pub fn require_role(
    metadata: &Metadata,
    validator: &TokenValidator,
    role: Role,
) -> Result<ValidToken, AuthError> {
    let token = bearer_token(metadata).ok_or(AuthError::BadToken)?;
    let valid = validator.validate(token)?;

    if valid.role() != role {
        return Err(AuthError::WrongRole(valid.role()));
    }

    Ok(valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tests::test_keys;
    use crate::token::TokenClaims;
    use chrono::Duration;
    use hzn_proto::Account;

    fn token_for(creator: &crate::TokenCreator, role: Role) -> String {
        creator
            .create(&TokenClaims::new(
                Account::new("/control", "control"),
                role,
                Duration::hours(1),
            ))
            .unwrap()
    }

    #[test]
    fn test_control_role_accepted() {
        let (creator, validator) = test_keys();
        let md = Metadata::new().with(AUTHORIZATION, token_for(&creator, Role::Control));

        let valid = require_role(&md, &validator, Role::Control).unwrap();
        assert_eq!(valid.role(), Role::Control);
    }

    #[test]
    fn test_missing_authorization() {
        let (_, validator) = test_keys();

        assert!(matches!(
            require_role(&Metadata::new(), &validator, Role::Control),
            Err(AuthError::BadToken)
        ));
    }

    #[test]
    fn test_wrong_role_rejected() {
        let (creator, validator) = test_keys();
        let md = Metadata::new().with(AUTHORIZATION, token_for(&creator, Role::Agent));

        assert!(matches!(
            require_role(&md, &validator, Role::Control),
            Err(AuthError::WrongRole(Role::Agent))
        ));
    }

    #[test]
    fn test_only_first_value_is_used() {
        let (creator, validator) = test_keys();
        let md = Metadata::new()
            .with(AUTHORIZATION, "garbage")
            .with(AUTHORIZATION, token_for(&creator, Role::Control));

        assert!(matches!(
            require_role(&md, &validator, Role::Control),
            Err(AuthError::Invalid(_))
        ));
    }
}
