use crate::auth::jwt::verify_token;
use crate::config::Config;
use crate::p9::error::{P9Error, P9Result};
use crate::{model::role::Role, models::{Claims, TokenType}};
use actix_web::{FromRequest, HttpMessage, HttpRequest, dev::Payload, error::ErrorUnauthorized, web::Data};
use futures::future::{Ready, ready};

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: u64,
    pub username: String,
    pub role: Role,

    /// Present only if this user is linked to an employee record
    pub employee_id: Option<u64>,
}

impl AuthUser {
    /// Builds the request identity from verified claims. Refresh tokens and
    /// unknown roles are refused.
    pub fn from_claims(claims: Claims) -> Result<Self, &'static str> {
        if claims.token_type != TokenType::Access {
            return Err("Access token required");
        }

        let role = Role::from_id(claims.role).ok_or("Invalid role")?;

        Ok(AuthUser {
            user_id: claims.user_id,
            username: claims.sub,
            role,
            employee_id: claims.employee_id,
        })
    }
}

impl FromRequest for AuthUser {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        // set by auth_middleware on protected routes
        if let Some(user) = req.extensions().get::<AuthUser>() {
            return ready(Ok(user.clone()));
        }

        let token = match req
            .headers()
            .get("Authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
        {
            Some(t) => t,
            None => return ready(Err(ErrorUnauthorized("Missing token"))),
        };

        let config = match req.app_data::<Data<Config>>() {
            Some(c) => c,
            None => {
                return ready(Err(
                    actix_web::error::ErrorInternalServerError("Config missing"),
                ))
            }
        };

        let claims = match verify_token(token, &config.jwt_secret) {
            Ok(c) => c,
            Err(_) => return ready(Err(ErrorUnauthorized("Invalid token"))),
        };

        ready(AuthUser::from_claims(claims).map_err(ErrorUnauthorized))
    }
}

impl AuthUser {
    pub fn require_admin(&self) -> P9Result<()> {
        if self.role == Role::Admin {
            Ok(())
        } else {
            Err(P9Error::Forbidden("Admin only"))
        }
    }

    pub fn require_hr_or_admin(&self) -> P9Result<()> {
        if self.is_staff() {
            Ok(())
        } else {
            Err(P9Error::Forbidden("HR/Admin only"))
        }
    }

    /// Admin, HR and system accounts may act on any employee's records.
    pub fn is_staff(&self) -> bool {
        self.role.is_staff()
    }

    /// The employee a request is about. Staff may name one; everyone else
    /// always gets their own record.
    pub fn resolve_employee(&self, requested: Option<u64>) -> P9Result<u64> {
        let employee_id = if self.is_staff() {
            requested.or(self.employee_id)
        } else {
            self.employee_id
        };

        employee_id.ok_or(P9Error::Forbidden("No employee record linked to this user"))
    }

    /// Whether this user may see records belonging to `employee_id`.
    pub fn can_view(&self, employee_id: u64) -> bool {
        self.is_staff() || self.employee_id == Some(employee_id)
    }
}
